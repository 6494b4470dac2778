mod access;
mod conflict;
mod error;
mod mutations;
mod queries;
mod store;
#[cfg(test)]
mod tests;
mod txn;

pub use conflict::{find_conflicts, is_conflict, validate_span, ConflictPolicy};
pub use error::EngineError;
pub use store::InMemoryStore;
pub use txn::BookingTxn;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard, RwLock};

use crate::model::*;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut pending = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            pending = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                if let Err(e) = &result {
                    tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
                }
                respond_batch(batch, &result);

                // A non-append command ends the batch window; it runs after the flush.
                if let Some(other) = pending {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    tracing::debug!("WAL writer stopped");
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so half-buffered bytes don't ride
    // along with the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let result = wal.append_buffered(&event).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

/// The scheduling engine: in-memory tables made durable through the WAL.
///
/// Lock order, outermost first: booking lock, participant locks (ascending
/// id), `catalog`, `wal_gate`.
pub struct Engine {
    pub(super) store: InMemoryStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) policy: ConflictPolicy,
    /// One mutex per user id that appears as a booking participant.
    participant_locks: DashMap<Id, Arc<Mutex<()>>>,
    /// One mutex per existing booking, held by updates and deletes.
    booking_locks: DashMap<Id, Arc<Mutex<()>>>,
    /// Booking writes hold this shared; training element deletes hold it
    /// exclusively so an element cannot vanish under a booking being written.
    pub(super) catalog: RwLock<()>,
    /// Serialises registration so the email uniqueness check holds.
    pub(super) registration: Mutex<()>,
    /// Every write holds this shared across WAL append + apply; compaction
    /// holds it exclusively while it snapshots and swaps the log.
    pub(super) wal_gate: RwLock<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, policy: ConflictPolicy) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = InMemoryStore::new();
        for event in &events {
            store.apply_event(event);
        }
        tracing::info!(
            "replayed {} events from {}: {} users, {} training elements, {} bookings",
            events.len(),
            wal_path.display(),
            store.user_count(),
            store.element_count(),
            store.booking_count(),
        );

        Ok(Self {
            store,
            wal_tx,
            policy,
            participant_locks: DashMap::new(),
            booking_locks: DashMap::new(),
            catalog: RwLock::new(()),
            registration: Mutex::new(()),
            wal_gate: RwLock::new(()),
        })
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append, then apply to memory. Nothing is visible until durable.
    pub(super) async fn persist_and_apply(&self, event: &Event) -> Result<(), EngineError> {
        let _gate = self.wal_gate.read().await;
        self.wal_append(event).await?;
        self.store.apply_event(event);
        Ok(())
    }

    /// Lock every participant in ascending id order, then the catalog for
    /// read. Duplicate ids are locked once.
    pub async fn begin_booking_txn(&self, participants: impl IntoIterator<Item = Id>) -> BookingTxn<'_> {
        self.lock_participants(None, participants).await
    }

    /// Lock an existing booking, then its current participants plus the ones
    /// `incoming` says it is about to get. Returns the booking as seen under
    /// the locks.
    pub async fn begin_booking_change(
        &self,
        id: Id,
        incoming: impl FnOnce(&Booking) -> [Option<Id>; 2],
    ) -> Result<(BookingTxn<'_>, Booking), EngineError> {
        let row = self.booking_locks.entry(id).or_default().clone();
        let row_guard = row.lock_owned().await;
        let current = self
            .store
            .get_booking(id)
            .ok_or(EngineError::NotFound { kind: "booking", id })?;
        let extra = incoming(&current);
        let participants: Vec<Id> = current.participants().chain(extra.into_iter().flatten()).collect();
        let txn = self.lock_participants(Some(row_guard), participants).await;
        Ok((txn, current))
    }

    pub(super) fn forget_booking_lock(&self, id: Id) {
        self.booking_locks.remove(&id);
    }

    async fn lock_participants(
        &self,
        row: Option<OwnedMutexGuard<()>>,
        participants: impl IntoIterator<Item = Id>,
    ) -> BookingTxn<'_> {
        let mut ids: Vec<Id> = participants.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();

        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let lock = self.participant_locks.entry(id).or_default().clone();
            guards.push(lock.lock_owned().await);
        }
        let catalog = self.catalog.read().await;
        BookingTxn::new(self, row, guards, catalog)
    }
}
