use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Row identifier, assigned from a per-table sequence starting at 1.
pub type Id = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Enumerations ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} '{value}', allowed: {allowed}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
    pub allowed: String,
}

/// Generates `as_str`, `ALL`, `Display` and `FromStr` for a unit-only enum
/// whose wire names are fixed strings.
macro_rules! wire_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $name),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_lowercase().as_str() {
                    $($name => Ok($ty::$variant),)+
                    _ => Err(ParseEnumError {
                        kind: $kind,
                        value: s.to_string(),
                        allowed: [$($name),+].join(", "),
                    }),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Admin,
    Instructor,
    Student,
}

wire_enum!(Role, "role", {
    Admin => "admin",
    Instructor => "instructor",
    Student => "student",
});

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    #[default]
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

wire_enum!(BookingStatus, "status", {
    Pending => "pending",
    Confirmed => "confirmed",
    Completed => "completed",
    Cancelled => "cancelled",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionType {
    Classroom,
    HandsOn,
    ELearning,
    Assessment,
}

wire_enum!(SessionType, "session type", {
    Classroom => "classroom",
    HandsOn => "hands_on",
    ELearning => "e_learning",
    Assessment => "assessment",
});

// ── Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Id,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: Role,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl User {
    /// "First Last", or whichever half is present.
    pub fn full_name(&self) -> Option<String> {
        match (&self.first_name, &self.last_name) {
            (Some(f), Some(l)) => Some(format!("{f} {l}")),
            (Some(f), None) => Some(f.clone()),
            (None, Some(l)) => Some(l.clone()),
            (None, None) => None,
        }
    }

    /// Case-insensitive substring match on first or last name.
    pub fn name_contains(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        [&self.first_name, &self.last_name]
            .into_iter()
            .flatten()
            .any(|n| n.to_lowercase().contains(&needle))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingElement {
    pub id: Id,
    pub name: String,
    pub description: String,
    pub duration_minutes: i64,
    pub session_type: SessionType,
    pub material_link: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Id,
    pub training_element_id: Id,
    pub instructor_id: Option<Id>,
    pub student_id: Option<Id>,
    pub start_time: Ms,
    pub end_time: Ms,
    pub status: BookingStatus,
    pub created_by_user_id: Id,
    pub notes: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    pub fn span(&self) -> Span {
        Span::new(self.start_time, self.end_time)
    }

    /// Instructor and student ids that are set, in that order.
    pub fn participants(&self) -> impl Iterator<Item = Id> {
        self.instructor_id.into_iter().chain(self.student_id)
    }
}

/// The user a connection acts as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Id,
    pub role: Role,
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered(User),
    TrainingElementCreated(TrainingElement),
    TrainingElementUpdated(TrainingElement),
    TrainingElementDeleted { id: Id },
    BookingCreated(Booking),
    BookingUpdated(Booking),
    BookingDeleted { id: Id },
    /// Highest ids ever handed out, so compaction never lets a deleted id
    /// be reassigned.
    SequenceFloor { users: Id, elements: Id, bookings: Id },
}

// ── Operation inputs ─────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewUser {
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: Option<Role>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewTrainingElement {
    pub name: Option<String>,
    pub description: Option<String>,
    pub duration_minutes: Option<i64>,
    pub session_type: Option<SessionType>,
    pub material_link: Option<String>,
}

/// Partial update. `None` leaves a field untouched; for nullable columns the
/// inner `Option` is the new value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrainingElementPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub duration_minutes: Option<i64>,
    pub session_type: Option<SessionType>,
    pub material_link: Option<Option<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewBooking {
    pub training_element_id: Option<Id>,
    pub instructor_id: Option<Id>,
    pub student_id: Option<Id>,
    pub start_time: Option<Ms>,
    pub end_time: Option<Ms>,
    pub status: Option<BookingStatus>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingPatch {
    pub training_element_id: Option<Id>,
    pub instructor_id: Option<Option<Id>>,
    pub student_id: Option<Option<Id>>,
    pub start_time: Option<Ms>,
    pub end_time: Option<Ms>,
    pub status: Option<BookingStatus>,
    pub notes: Option<Option<String>>,
}

impl BookingPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub id: Option<Id>,
    pub training_element_name: Option<String>,
    pub start_from: Option<Ms>,
    pub end_until: Option<Ms>,
    pub instructor_id: Option<Id>,
    pub instructor_name: Option<String>,
    pub student_id: Option<Id>,
    pub student_name: Option<String>,
    pub status: Option<BookingStatus>,
    pub created_by_user_id: Option<Id>,
    pub created_by_name: Option<String>,
}

/// A candidate booking for the conflict checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictQuery {
    pub span: Span,
    pub instructor_id: Option<Id>,
    pub student_id: Option<Id>,
    pub exclude_booking_id: Option<Id>,
}

// ── Query result types ───────────────────────────────────────────

/// A booking joined with the display names of everything it references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingDetails {
    pub booking: Booking,
    pub training_element_name: Option<String>,
    pub instructor_name: Option<String>,
    pub student_name: Option<String>,
    pub created_by_email: Option<String>,
}

// ── Timestamps ───────────────────────────────────────────────────

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// Parse integer milliseconds, RFC 3339, or a naive ISO 8601 date-time
/// (interpreted as UTC, trailing `Z` allowed).
pub fn parse_timestamp(s: &str) -> Option<Ms> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<Ms>() {
        return Some(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    let naive = s.strip_suffix(['Z', 'z']).unwrap_or(s);
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(naive, fmt).ok())
        .map(|dt| dt.and_utc().timestamp_millis())
}

/// RFC 3339 in UTC; sub-second digits only when present.
pub fn format_timestamp(ms: Ms) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        .unwrap_or_else(|| ms.to_string())
}
