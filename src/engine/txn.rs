use tokio::sync::{OwnedMutexGuard, RwLockReadGuard};

use crate::model::*;

use super::conflict;
use super::{Engine, EngineError};

/// A booking write in progress. Holds the locks of every participant it
/// touches, so the conflict scan and the commit see the same schedule.
pub struct BookingTxn<'a> {
    engine: &'a Engine,
    _row: Option<OwnedMutexGuard<()>>,
    participants: Vec<OwnedMutexGuard<()>>,
    _catalog: RwLockReadGuard<'a, ()>,
}

impl<'a> BookingTxn<'a> {
    pub(super) fn new(
        engine: &'a Engine,
        row: Option<OwnedMutexGuard<()>>,
        participants: Vec<OwnedMutexGuard<()>>,
        catalog: RwLockReadGuard<'a, ()>,
    ) -> Self {
        Self { engine, _row: row, participants, _catalog: catalog }
    }

    pub fn locked_participants(&self) -> usize {
        self.participants.len()
    }

    /// Scan the participant indexes under the held locks.
    pub fn find_conflicts(&self, query: &ConflictQuery) -> Vec<Booking> {
        let candidates = self
            .engine
            .store
            .bookings_for_participants(query.instructor_id, query.student_id);
        conflict::find_conflicts(&candidates, query, self.engine.policy)
    }

    /// `Conflict` if the candidate collides with anything under the held
    /// locks. The transaction stays open either way.
    pub fn check(&self, query: &ConflictQuery) -> Result<(), EngineError> {
        let conflicts = self.find_conflicts(query);
        if conflicts.is_empty() {
            return Ok(());
        }
        metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
        tracing::warn!(
            "booking rejected: {} conflict(s), first id {}",
            conflicts.len(),
            conflicts[0].id
        );
        Err(EngineError::Conflict(conflicts))
    }

    /// Reject with `Conflict` if the candidate collides, otherwise persist
    /// `event`. Consumes the transaction; the locks drop afterwards.
    pub async fn check_and_commit(self, query: &ConflictQuery, event: Event) -> Result<(), EngineError> {
        self.check(query)?;
        self.commit(event).await
    }

    pub async fn commit(self, event: Event) -> Result<(), EngineError> {
        self.engine.persist_and_apply(&event).await
    }
}
