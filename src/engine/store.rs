use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;

use crate::model::*;

/// In-memory tables plus the secondary indexes the engine queries by.
/// Mutated only through `apply_event`, so replay and live writes share one
/// code path.
pub struct InMemoryStore {
    users: DashMap<Id, User>,
    /// Lowercased email → user id.
    user_emails: DashMap<String, Id>,
    elements: DashMap<Id, TrainingElement>,
    bookings: DashMap<Id, Booking>,
    by_instructor: DashMap<Id, Vec<Id>>,
    by_student: DashMap<Id, Vec<Id>>,
    by_element: DashMap<Id, Vec<Id>>,
    user_seq: AtomicI64,
    element_seq: AtomicI64,
    booking_seq: AtomicI64,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn index_add(index: &DashMap<Id, Vec<Id>>, key: Option<Id>, id: Id) {
    if let Some(key) = key {
        index.entry(key).or_default().push(id);
    }
}

fn index_remove(index: &DashMap<Id, Vec<Id>>, key: Option<Id>, id: Id) {
    let Some(key) = key else { return };
    if let Some(mut ids) = index.get_mut(&key) {
        ids.retain(|b| *b != id);
    }
    index.remove_if(&key, |_, ids| ids.is_empty());
}

fn index_get(index: &DashMap<Id, Vec<Id>>, key: Id) -> Vec<Id> {
    index.get(&key).map(|e| e.value().clone()).unwrap_or_default()
}

fn sorted_by_id<T: Clone>(map: &DashMap<Id, T>) -> Vec<T> {
    let mut rows: Vec<(Id, T)> = map.iter().map(|e| (*e.key(), e.value().clone())).collect();
    rows.sort_by_key(|(id, _)| *id);
    rows.into_iter().map(|(_, row)| row).collect()
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            user_emails: DashMap::new(),
            elements: DashMap::new(),
            bookings: DashMap::new(),
            by_instructor: DashMap::new(),
            by_student: DashMap::new(),
            by_element: DashMap::new(),
            user_seq: AtomicI64::new(0),
            element_seq: AtomicI64::new(0),
            booking_seq: AtomicI64::new(0),
        }
    }

    // ── Sequences ────────────────────────────────────────────

    pub fn next_user_id(&self) -> Id {
        self.user_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn next_element_id(&self) -> Id {
        self.element_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn next_booking_id(&self) -> Id {
        self.booking_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    // ── Users ────────────────────────────────────────────────

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn get_user(&self, id: Id) -> Option<User> {
        self.users.get(&id).map(|e| e.value().clone())
    }

    pub fn user_by_email(&self, email: &str) -> Option<User> {
        let id = *self.user_emails.get(&email.to_lowercase())?.value();
        self.get_user(id)
    }

    pub fn users(&self) -> Vec<User> {
        sorted_by_id(&self.users)
    }

    // ── Training elements ────────────────────────────────────

    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    pub fn get_element(&self, id: Id) -> Option<TrainingElement> {
        self.elements.get(&id).map(|e| e.value().clone())
    }

    pub fn elements(&self) -> Vec<TrainingElement> {
        sorted_by_id(&self.elements)
    }

    pub fn element_in_use(&self, id: Id) -> bool {
        self.by_element.get(&id).is_some_and(|ids| !ids.is_empty())
    }

    // ── Bookings ─────────────────────────────────────────────

    pub fn booking_count(&self) -> usize {
        self.bookings.len()
    }

    pub fn get_booking(&self, id: Id) -> Option<Booking> {
        self.bookings.get(&id).map(|e| e.value().clone())
    }

    pub fn bookings(&self) -> Vec<Booking> {
        sorted_by_id(&self.bookings)
    }

    /// Bookings where `instructor_id` teaches or `student_id` attends. May
    /// contain the same booking twice when it matches both.
    pub fn bookings_for_participants(&self, instructor_id: Option<Id>, student_id: Option<Id>) -> Vec<Booking> {
        let mut ids = Vec::new();
        if let Some(i) = instructor_id {
            ids.extend(index_get(&self.by_instructor, i));
        }
        if let Some(s) = student_id {
            ids.extend(index_get(&self.by_student, s));
        }
        ids.into_iter().filter_map(|id| self.get_booking(id)).collect()
    }

    // ── Event application ────────────────────────────────────

    pub fn apply_event(&self, event: &Event) {
        match event {
            Event::UserRegistered(user) => {
                self.user_seq.fetch_max(user.id, Ordering::SeqCst);
                self.user_emails.insert(user.email.to_lowercase(), user.id);
                self.users.insert(user.id, user.clone());
            }
            Event::TrainingElementCreated(element) | Event::TrainingElementUpdated(element) => {
                self.element_seq.fetch_max(element.id, Ordering::SeqCst);
                self.elements.insert(element.id, element.clone());
            }
            Event::TrainingElementDeleted { id } => {
                self.elements.remove(id);
            }
            Event::BookingCreated(booking) | Event::BookingUpdated(booking) => {
                self.booking_seq.fetch_max(booking.id, Ordering::SeqCst);
                if let Some(old) = self.bookings.insert(booking.id, booking.clone()) {
                    self.unindex_booking(&old);
                }
                self.index_booking(booking);
            }
            Event::BookingDeleted { id } => {
                if let Some((_, old)) = self.bookings.remove(id) {
                    self.unindex_booking(&old);
                }
            }
            Event::SequenceFloor { users, elements, bookings } => {
                self.user_seq.fetch_max(*users, Ordering::SeqCst);
                self.element_seq.fetch_max(*elements, Ordering::SeqCst);
                self.booking_seq.fetch_max(*bookings, Ordering::SeqCst);
            }
        }
    }

    fn index_booking(&self, b: &Booking) {
        index_add(&self.by_instructor, b.instructor_id, b.id);
        index_add(&self.by_student, b.student_id, b.id);
        index_add(&self.by_element, Some(b.training_element_id), b.id);
    }

    fn unindex_booking(&self, b: &Booking) {
        index_remove(&self.by_instructor, b.instructor_id, b.id);
        index_remove(&self.by_student, b.student_id, b.id);
        index_remove(&self.by_element, Some(b.training_element_id), b.id);
    }

    /// Minimal event list that rebuilds the current state from empty.
    pub fn snapshot_events(&self) -> Vec<Event> {
        let mut events = vec![Event::SequenceFloor {
            users: self.user_seq.load(Ordering::SeqCst),
            elements: self.element_seq.load(Ordering::SeqCst),
            bookings: self.booking_seq.load(Ordering::SeqCst),
        }];
        events.extend(self.users().into_iter().map(Event::UserRegistered));
        events.extend(self.elements().into_iter().map(Event::TrainingElementCreated));
        events.extend(self.bookings().into_iter().map(Event::BookingCreated));
        events
    }
}
