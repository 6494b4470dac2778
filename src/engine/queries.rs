use crate::model::*;

use super::access::{require_login, require_role};
use super::conflict;
use super::{Engine, EngineError};

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

impl Engine {
    /// Map a login name to the registered user acting under it.
    pub fn resolve_actor(&self, login: &str) -> Option<Actor> {
        self.store.user_by_email(login).map(|u| Actor { id: u.id, role: u.role })
    }

    pub fn list_users(&self, actor: Option<&Actor>) -> Result<Vec<User>, EngineError> {
        require_role(actor, &[Role::Admin])?;
        Ok(self.store.users())
    }

    pub fn list_training_elements(&self) -> Vec<TrainingElement> {
        self.store.elements()
    }

    pub fn get_training_element(&self, actor: Option<&Actor>, id: Id) -> Result<TrainingElement, EngineError> {
        require_role(actor, &[Role::Admin, Role::Instructor])?;
        self.store
            .get_element(id)
            .ok_or(EngineError::NotFound { kind: "training element", id })
    }

    pub fn session_types(&self) -> &'static [SessionType] {
        SessionType::ALL
    }

    /// Join a booking with the names of everything it references.
    pub fn booking_details(&self, booking: Booking) -> BookingDetails {
        let name_of = |id: Option<Id>| id.and_then(|id| self.store.get_user(id)).and_then(|u| u.full_name());
        BookingDetails {
            training_element_name: self.store.get_element(booking.training_element_id).map(|e| e.name),
            instructor_name: name_of(booking.instructor_id),
            student_name: name_of(booking.student_id),
            created_by_email: self.store.get_user(booking.created_by_user_id).map(|u| u.email),
            booking,
        }
    }

    fn matches_filter(&self, b: &Booking, f: &BookingFilter) -> bool {
        if f.id.is_some_and(|id| b.id != id)
            || f.start_from.is_some_and(|t| b.start_time < t)
            || f.end_until.is_some_and(|t| b.end_time > t)
            || f.instructor_id.is_some_and(|id| b.instructor_id != Some(id))
            || f.student_id.is_some_and(|id| b.student_id != Some(id))
            || f.status.is_some_and(|s| b.status != s)
            || f.created_by_user_id.is_some_and(|id| b.created_by_user_id != id)
        {
            return false;
        }
        if let Some(needle) = &f.training_element_name {
            let hit = self
                .store
                .get_element(b.training_element_id)
                .is_some_and(|e| contains_ci(&e.name, needle));
            if !hit {
                return false;
            }
        }
        let user_named = |id: Option<Id>, needle: &Option<String>| match needle {
            None => true,
            Some(n) => id.and_then(|id| self.store.get_user(id)).is_some_and(|u| u.name_contains(n)),
        };
        user_named(b.instructor_id, &f.instructor_name)
            && user_named(b.student_id, &f.student_name)
            && user_named(Some(b.created_by_user_id), &f.created_by_name)
    }

    /// Bookings matching every set filter, ordered by start time then id.
    pub fn list_bookings(&self, actor: Option<&Actor>, filter: &BookingFilter) -> Result<Vec<BookingDetails>, EngineError> {
        require_login(actor)?;
        let mut rows: Vec<Booking> = match filter.id {
            Some(id) => self.store.get_booking(id).into_iter().collect(),
            None => self.store.bookings(),
        };
        rows.retain(|b| self.matches_filter(b, filter));
        rows.sort_by_key(|b| (b.start_time, b.id));
        tracing::debug!("list_bookings matched {} rows", rows.len());
        Ok(rows.into_iter().map(|b| self.booking_details(b)).collect())
    }

    pub fn get_booking(&self, actor: Option<&Actor>, id: Id) -> Result<BookingDetails, EngineError> {
        require_login(actor)?;
        let booking = self
            .store
            .get_booking(id)
            .ok_or(EngineError::NotFound { kind: "booking", id })?;
        Ok(self.booking_details(booking))
    }

    /// Bookings that would block the candidate, ordered by start time then id.
    /// Read-only; a write must repeat the check inside a `BookingTxn`.
    pub fn find_conflicts(&self, query: &ConflictQuery) -> Vec<Booking> {
        let candidates = self
            .store
            .bookings_for_participants(query.instructor_id, query.student_id);
        conflict::find_conflicts(&candidates, query, self.policy)
    }

    pub fn store(&self) -> &super::InMemoryStore {
        &self.store
    }
}
