use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Which existing bookings are allowed to block a candidate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConflictPolicy {
    /// Cancelled bookings stop holding their slot.
    pub ignore_cancelled: bool,
}

/// Caller-side checks on a candidate interval. The checker itself assumes
/// `start < end` and never calls this.
pub fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    use crate::limits::*;
    if end <= start {
        return Err(EngineError::Validation("end_time must be after start_time".into()));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if end - start > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("booking too long"));
    }
    Ok(Span::new(start, end))
}

/// `existing` blocks the candidate iff it is not the excluded booking, the
/// half-open intervals intersect, and it shares the instructor or the student
/// (each compared only against the same role, and only when set).
pub fn is_conflict(existing: &Booking, query: &ConflictQuery, policy: ConflictPolicy) -> bool {
    if query.exclude_booking_id == Some(existing.id) {
        return false;
    }
    if policy.ignore_cancelled && existing.status == BookingStatus::Cancelled {
        return false;
    }
    if !existing.span().overlaps(&query.span) {
        return false;
    }
    let instructor_clash = query.instructor_id.is_some() && existing.instructor_id == query.instructor_id;
    let student_clash = query.student_id.is_some() && existing.student_id == query.student_id;
    instructor_clash || student_clash
}

/// Every booking in `existing` that blocks the candidate, ordered by start
/// time then id. An empty result means the write may proceed.
pub fn find_conflicts<'a>(
    existing: impl IntoIterator<Item = &'a Booking>,
    query: &ConflictQuery,
    policy: ConflictPolicy,
) -> Vec<Booking> {
    if query.instructor_id.is_none() && query.student_id.is_none() {
        return Vec::new();
    }
    let mut hits: Vec<Booking> = existing
        .into_iter()
        .filter(|b| is_conflict(b, query, policy))
        .cloned()
        .collect();
    hits.sort_by_key(|b| (b.start_time, b.id));
    hits.dedup_by_key(|b| b.id);
    hits
}
