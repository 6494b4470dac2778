use tokio::sync::oneshot;

use crate::limits::*;
use crate::model::*;

use super::access::{require_login, require_role};
use super::conflict::{now_ms, validate_span};
use super::{Engine, EngineError, WalCommand};

fn check_len(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.chars().count() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

/// Trimmed value, or `None` for blank input.
fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn missing_fields(fields: &[(&str, bool)]) -> EngineError {
    let missing: Vec<&str> = fields.iter().filter(|(_, present)| !present).map(|(name, _)| *name).collect();
    EngineError::Validation(format!("missing required fields: {}", missing.join(", ")))
}

fn validate_duration(minutes: i64) -> Result<(), EngineError> {
    if minutes <= 0 {
        return Err(EngineError::Validation("duration_minutes must be a positive number".into()));
    }
    if minutes > MAX_DURATION_MINUTES {
        return Err(EngineError::LimitExceeded("duration_minutes too large"));
    }
    Ok(())
}

impl Engine {
    // ── Users ────────────────────────────────────────────────

    pub async fn register_user(&self, actor: Option<&Actor>, input: NewUser) -> Result<User, EngineError> {
        let role = input.role.unwrap_or(Role::Student);
        if role == Role::Admin {
            let actor = require_login(actor)?;
            if actor.role != Role::Admin {
                return Err(EngineError::Forbidden("only an admin may register another admin".into()));
            }
        }

        let email = input.email.trim().to_string();
        if email.is_empty() || !email.contains('@') {
            return Err(EngineError::Validation(format!("'{email}' is not a valid email address")));
        }
        check_len(&email, MAX_EMAIL_LEN, "email too long")?;
        let first_name = non_blank(input.first_name);
        let last_name = non_blank(input.last_name);
        for name in first_name.iter().chain(&last_name) {
            check_len(name, MAX_PERSON_NAME_LEN, "name too long")?;
        }

        let _registration = self.registration.lock().await;
        if self.store.user_by_email(&email).is_some() {
            return Err(EngineError::AlreadyExists(format!("user with email {email}")));
        }
        if self.store.user_count() >= MAX_USERS {
            return Err(EngineError::LimitExceeded("too many users"));
        }

        let now = now_ms();
        let user = User {
            id: self.store.next_user_id(),
            email,
            first_name,
            last_name,
            role,
            created_at: now,
            updated_at: now,
        };
        self.persist_and_apply(&Event::UserRegistered(user.clone())).await?;
        tracing::info!("registered user {} ({}) as {}", user.id, user.email, user.role);
        Ok(user)
    }

    /// Startup bootstrap: make sure an admin with `email` exists.
    pub async fn ensure_admin(&self, email: &str) -> Result<User, EngineError> {
        if let Some(existing) = self.store.user_by_email(email) {
            if existing.role != Role::Admin {
                tracing::warn!("bootstrap user {email} exists with role {}", existing.role);
            }
            return Ok(existing);
        }
        let bootstrap = Actor { id: 0, role: Role::Admin };
        let input = NewUser {
            email: email.to_string(),
            first_name: Some("Admin".into()),
            last_name: Some("User".into()),
            role: Some(Role::Admin),
        };
        match self.register_user(Some(&bootstrap), input).await {
            // Lost a race with a concurrent bootstrap.
            Err(EngineError::AlreadyExists(_)) => self
                .store
                .user_by_email(email)
                .ok_or_else(|| EngineError::WalError("admin vanished during bootstrap".into())),
            other => other,
        }
    }

    // ── Training elements ────────────────────────────────────

    pub async fn create_training_element(
        &self,
        actor: Option<&Actor>,
        input: NewTrainingElement,
    ) -> Result<TrainingElement, EngineError> {
        require_role(actor, &[Role::Admin, Role::Instructor])?;

        let name = non_blank(input.name);
        let description = non_blank(input.description);
        let required = [
            ("name", name.is_some()),
            ("description", description.is_some()),
            ("duration_minutes", input.duration_minutes.is_some()),
            ("session_type", input.session_type.is_some()),
        ];
        let (Some(name), Some(description), Some(duration_minutes), Some(session_type)) =
            (name, description, input.duration_minutes, input.session_type)
        else {
            return Err(missing_fields(&required));
        };
        check_len(&name, MAX_ELEMENT_NAME_LEN, "training element name too long")?;
        check_len(&description, MAX_DESCRIPTION_LEN, "description too long")?;
        validate_duration(duration_minutes)?;
        let material_link = non_blank(input.material_link);
        if let Some(link) = &material_link {
            check_len(link, MAX_MATERIAL_LINK_LEN, "material_link too long")?;
        }
        if self.store.element_count() >= MAX_TRAINING_ELEMENTS {
            return Err(EngineError::LimitExceeded("too many training elements"));
        }

        let now = now_ms();
        let element = TrainingElement {
            id: self.store.next_element_id(),
            name,
            description,
            duration_minutes,
            session_type,
            material_link,
            created_at: now,
            updated_at: now,
        };
        self.persist_and_apply(&Event::TrainingElementCreated(element.clone())).await?;
        tracing::info!("created training element {} '{}'", element.id, element.name);
        Ok(element)
    }

    pub async fn update_training_element(
        &self,
        actor: Option<&Actor>,
        id: Id,
        patch: TrainingElementPatch,
    ) -> Result<TrainingElement, EngineError> {
        require_role(actor, &[Role::Instructor])?;
        if patch == TrainingElementPatch::default() {
            return Err(EngineError::Validation("no fields to update".into()));
        }

        let _catalog = self.catalog.write().await;
        let mut element = self
            .store
            .get_element(id)
            .ok_or(EngineError::NotFound { kind: "training element", id })?;

        if let Some(name) = patch.name {
            let name = non_blank(Some(name)).ok_or_else(|| EngineError::Validation("name must not be empty".into()))?;
            check_len(&name, MAX_ELEMENT_NAME_LEN, "training element name too long")?;
            element.name = name;
        }
        if let Some(description) = patch.description {
            let description = non_blank(Some(description))
                .ok_or_else(|| EngineError::Validation("description must not be empty".into()))?;
            check_len(&description, MAX_DESCRIPTION_LEN, "description too long")?;
            element.description = description;
        }
        if let Some(minutes) = patch.duration_minutes {
            validate_duration(minutes)?;
            element.duration_minutes = minutes;
        }
        if let Some(session_type) = patch.session_type {
            element.session_type = session_type;
        }
        if let Some(link) = patch.material_link {
            let link = non_blank(link);
            if let Some(l) = &link {
                check_len(l, MAX_MATERIAL_LINK_LEN, "material_link too long")?;
            }
            element.material_link = link;
        }
        element.updated_at = now_ms();

        self.persist_and_apply(&Event::TrainingElementUpdated(element.clone())).await?;
        tracing::info!("updated training element {id}");
        Ok(element)
    }

    pub async fn delete_training_element(&self, actor: Option<&Actor>, id: Id) -> Result<(), EngineError> {
        require_role(actor, &[Role::Instructor])?;

        let _catalog = self.catalog.write().await;
        if self.store.get_element(id).is_none() {
            return Err(EngineError::NotFound { kind: "training element", id });
        }
        if self.store.element_in_use(id) {
            return Err(EngineError::InUse { kind: "training element", id });
        }
        self.persist_and_apply(&Event::TrainingElementDeleted { id }).await?;
        tracing::info!("deleted training element {id}");
        Ok(())
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Referenced rows must exist. Called with the catalog lock held.
    fn check_booking_refs(
        &self,
        training_element_id: Id,
        instructor_id: Option<Id>,
        student_id: Option<Id>,
    ) -> Result<(), EngineError> {
        if self.store.get_element(training_element_id).is_none() {
            return Err(EngineError::Validation(format!(
                "training element with id {training_element_id} not found"
            )));
        }
        for (role, id) in [("instructor", instructor_id), ("student", student_id)] {
            if let Some(id) = id
                && self.store.get_user(id).is_none() {
                    return Err(EngineError::Validation(format!("{role} with id {id} not found")));
                }
        }
        Ok(())
    }

    pub async fn create_booking(&self, actor: Option<&Actor>, input: NewBooking) -> Result<Booking, EngineError> {
        let actor = require_role(actor, &[Role::Instructor])?;

        let required = [
            ("training_element_id", input.training_element_id.is_some()),
            ("start_time", input.start_time.is_some()),
            ("end_time", input.end_time.is_some()),
        ];
        let (Some(training_element_id), Some(start_time), Some(end_time)) =
            (input.training_element_id, input.start_time, input.end_time)
        else {
            return Err(missing_fields(&required));
        };
        let span = validate_span(start_time, end_time)?;
        let notes = non_blank(input.notes);
        if let Some(n) = &notes {
            check_len(n, MAX_NOTES_LEN, "notes too long")?;
        }
        if self.store.booking_count() >= MAX_BOOKINGS {
            return Err(EngineError::LimitExceeded("too many bookings"));
        }

        let txn = self
            .begin_booking_txn(input.instructor_id.into_iter().chain(input.student_id))
            .await;
        self.check_booking_refs(training_element_id, input.instructor_id, input.student_id)?;

        let now = now_ms();
        let mut booking = Booking {
            id: 0,
            training_element_id,
            instructor_id: input.instructor_id,
            student_id: input.student_id,
            start_time: span.start,
            end_time: span.end,
            status: input.status.unwrap_or_default(),
            created_by_user_id: actor.id,
            notes,
            created_at: now,
            updated_at: now,
        };
        let query = ConflictQuery {
            span,
            instructor_id: booking.instructor_id,
            student_id: booking.student_id,
            exclude_booking_id: None,
        };
        // Rejected creates must not use up an id.
        txn.check(&query)?;
        booking.id = self.store.next_booking_id();
        txn.commit(Event::BookingCreated(booking.clone())).await?;
        tracing::info!(
            "booking {} created by user {}: element {}, {}..{}",
            booking.id,
            actor.id,
            booking.training_element_id,
            booking.start_time,
            booking.end_time,
        );
        Ok(booking)
    }

    pub async fn update_booking(
        &self,
        actor: Option<&Actor>,
        id: Id,
        patch: BookingPatch,
    ) -> Result<Booking, EngineError> {
        require_role(actor, &[Role::Instructor])?;
        if patch.is_empty() {
            return Err(EngineError::Validation("no fields to update".into()));
        }
        if let Some(Some(n)) = &patch.notes {
            check_len(n, MAX_NOTES_LEN, "notes too long")?;
        }

        // Lock the participants the booking has now and the ones it will have.
        let (txn, original) = self
            .begin_booking_change(id, |current| {
                [
                    patch.instructor_id.unwrap_or(current.instructor_id),
                    patch.student_id.unwrap_or(current.student_id),
                ]
            })
            .await?;

        let mut booking = original.clone();
        if let Some(element_id) = patch.training_element_id {
            booking.training_element_id = element_id;
        }
        if let Some(instructor_id) = patch.instructor_id {
            booking.instructor_id = instructor_id;
        }
        if let Some(student_id) = patch.student_id {
            booking.student_id = student_id;
        }
        if let Some(start) = patch.start_time {
            booking.start_time = start;
        }
        if let Some(end) = patch.end_time {
            booking.end_time = end;
        }
        if let Some(status) = patch.status {
            booking.status = status;
        }
        if let Some(notes) = patch.notes {
            booking.notes = non_blank(notes);
        }
        let span = validate_span(booking.start_time, booking.end_time)?;
        self.check_booking_refs(booking.training_element_id, booking.instructor_id, booking.student_id)?;
        booking.updated_at = now_ms();

        // A cancelled booking that no longer held its slot has to win it back.
        let revives = self.policy.ignore_cancelled
            && original.status == BookingStatus::Cancelled
            && booking.status != BookingStatus::Cancelled;
        let reschedules = revives
            || booking.start_time != original.start_time
            || booking.end_time != original.end_time
            || booking.instructor_id != original.instructor_id
            || booking.student_id != original.student_id;
        let event = Event::BookingUpdated(booking.clone());
        if reschedules {
            let query = ConflictQuery {
                span,
                instructor_id: booking.instructor_id,
                student_id: booking.student_id,
                exclude_booking_id: Some(id),
            };
            txn.check_and_commit(&query, event).await?;
        } else {
            txn.commit(event).await?;
        }
        tracing::info!("booking {id} updated (rescheduled: {reschedules})");
        Ok(booking)
    }

    /// Admins may delete any booking, instructors only the ones they created.
    pub async fn delete_booking(&self, actor: Option<&Actor>, id: Id) -> Result<(), EngineError> {
        let actor = require_login(actor)?;
        let (txn, booking) = self.begin_booking_change(id, |_| [None, None]).await?;
        let allowed = match actor.role {
            Role::Admin => true,
            Role::Instructor => booking.created_by_user_id == actor.id,
            Role::Student => false,
        };
        if !allowed {
            return Err(EngineError::Forbidden(
                "you must be an admin or the creator of this booking to delete it".into(),
            ));
        }
        txn.commit(Event::BookingDeleted { id }).await?;
        self.forget_booking_lock(id);
        tracing::info!("booking {id} deleted by user {}", actor.id);
        Ok(())
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as the minimal event set for the current state.
    /// Writes wait on the gate until the new log is in place.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.wal_gate.write().await;
        let events = self.store.snapshot_events();
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        tracing::info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
