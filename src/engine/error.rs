use crate::model::{Booking, Id, Role};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{kind} with id {id} not found")]
    NotFound { kind: &'static str, id: Id },
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// Carries every existing booking the candidate collides with.
    #[error("{}", conflict_message(.0))]
    Conflict(Vec<Booking>),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("login required")]
    Unauthenticated,
    #[error("access denied: {0}")]
    Forbidden(String),
    #[error("{kind} with id {id} is still referenced by bookings")]
    InUse { kind: &'static str, id: Id },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    pub(crate) fn forbidden_unless(role: Role, allowed: &[Role]) -> Self {
        let allowed: Vec<_> = allowed.iter().map(Role::as_str).collect();
        EngineError::Forbidden(format!("role {role} is not one of [{}]", allowed.join(", ")))
    }
}

fn conflict_message(bookings: &[Booking]) -> String {
    let payload = serde_json::to_string(bookings).unwrap_or_default();
    format!("booking conflict: instructor or student is already booked during this time; conflicts: {payload}")
}
