use crate::model::Ms;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_000;
/// A single session may not run longer than a week.
pub const MAX_SPAN_DURATION_MS: Ms = 7 * 24 * 3_600_000;

pub const MAX_EMAIL_LEN: usize = 120;
pub const MAX_PERSON_NAME_LEN: usize = 50;
pub const MAX_ELEMENT_NAME_LEN: usize = 100;
pub const MAX_DESCRIPTION_LEN: usize = 10_000;
pub const MAX_MATERIAL_LINK_LEN: usize = 255;
pub const MAX_NOTES_LEN: usize = 2_000;
pub const MAX_DURATION_MINUTES: i64 = 7 * 24 * 60;

pub const MAX_USERS: usize = 100_000;
pub const MAX_TRAINING_ELEMENTS: usize = 100_000;
pub const MAX_BOOKINGS: usize = 1_000_000;
