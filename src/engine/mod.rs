mod availability;
mod blackout;
mod conflict;
mod error;
mod mutations;
mod queries;
mod store;

pub use availability::available_slots;
pub use blackout::BlackoutRegistry;
pub use conflict::SlotVerdict;
pub use error::EngineError;
pub use store::ReservationStore;

pub(crate) use conflict::now_ms;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{
    mpsc, oneshot, Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock,
};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::calendar::SlotCalendar;
use crate::limits::*;
use crate::model::*;
use crate::wal::Wal;

pub type SharedPropertyState = Arc<RwLock<PropertyState>>;

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
                let mut trailing = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            trailing = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                if let Err(e) = &result {
                    warn!(error = %e, events = batch.len(), "WAL flush failed");
                }
                respond_batch(batch, &result);

                // A non-append command seen while draining runs after the batch it followed.
                if let Some(other) = trailing {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    debug!("WAL writer stopped");
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            // Every sender hears Err, so none of the batch may reach the file.
            wal.discard_pending();
            return Err(e);
        }
    }
    wal.flush_sync()
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
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let result = match wal.append_buffered(&event) {
                Ok(()) => wal.flush_sync(),
                Err(e) => {
                    wal.discard_pending();
                    Err(e)
                }
            };
            let _ = response.send(result);
        }
    }
}

/// Hand one event to the writer and wait for it to be durable.
///
/// Enqueueing is bounded by `WAL_ENQUEUE_TIMEOUT`; a full channel is retried
/// with exponential backoff before giving up as `Transient`.
async fn append_event(wal_tx: &mpsc::Sender<WalCommand>, event: &Event) -> Result<(), EngineError> {
    let (tx, rx) = oneshot::channel();
    let mut cmd = WalCommand::Append {
        event: event.clone(),
        response: tx,
    };
    let mut backoff = WAL_RETRY_BASE_BACKOFF;
    let mut attempt = 1;
    loop {
        match wal_tx.send_timeout(cmd, WAL_ENQUEUE_TIMEOUT).await {
            Ok(()) => break,
            Err(SendTimeoutError::Timeout(returned)) if attempt < WAL_ENQUEUE_ATTEMPTS => {
                warn!(attempt, backoff_ms = backoff.as_millis() as u64, "WAL enqueue timed out, retrying");
                metrics::counter!(crate::observability::WAL_ENQUEUE_RETRIES_TOTAL).increment(1);
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                attempt += 1;
                cmd = returned;
            }
            Err(SendTimeoutError::Timeout(_)) => {
                return Err(EngineError::Transient("WAL enqueue timed out".into()));
            }
            Err(SendTimeoutError::Closed(_)) => {
                return Err(EngineError::Transient("WAL writer shut down".into()));
            }
        }
    }
    rx.await
        .map_err(|_| EngineError::Transient("WAL writer dropped response".into()))?
        .map_err(|e| EngineError::Transient(format!("WAL write failed: {e}")))
}

/// Locks held by a reservation commit: the shared side of the commit gate,
/// then the property write lock. Always acquired in that order.
pub(super) struct PropertyLocks {
    _gate: OwnedRwLockReadGuard<()>,
    pub(super) property: OwnedRwLockWriteGuard<PropertyState>,
}

/// Locks held by a blackout commit.
pub(super) struct BlackoutLocks {
    _writer: OwnedMutexGuard<()>,
    _gate: OwnedRwLockReadGuard<()>,
}

pub struct Engine {
    pub(super) calendar: SlotCalendar,
    pub(super) store: Arc<ReservationStore>,
    pub(super) blackouts: Arc<BlackoutRegistry>,
    /// Serializes blackout writers; readers go straight to the registry.
    blackout_lock: Arc<Mutex<()>>,
    /// Shared by every commit, exclusive for compaction.
    commit_gate: Arc<RwLock<()>>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub(super) complete_confirmed: bool,
}

impl Engine {
    pub fn new(wal_path: PathBuf, calendar: SlotCalendar) -> io::Result<Self> {
        let (wal, replay) = Wal::recover(&wal_path)?;
        if replay.torn_tail {
            warn!(
                path = %wal_path.display(),
                valid_len = replay.valid_len,
                "truncated a torn record at the end of the WAL"
            );
        }
        let events = replay.events;
        let (wal_tx, wal_rx) = mpsc::channel(WAL_CHANNEL_CAPACITY);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            calendar,
            store: Arc::new(ReservationStore::new()),
            blackouts: Arc::new(BlackoutRegistry::new()),
            blackout_lock: Arc::new(Mutex::new(())),
            commit_gate: Arc::new(RwLock::new(())),
            wal_tx,
            complete_confirmed: true,
        };

        // Sole owner of every lock during replay, so try_write never contends.
        for event in &events {
            match event.property_id() {
                Some(property_id) => {
                    let ps = engine.store.get_or_create_property(property_id);
                    let mut guard = ps.try_write().map_err(|_| {
                        io::Error::other(format!("property {property_id} locked during WAL replay"))
                    })?;
                    engine.store.apply_event(&mut guard, event);
                }
                None => engine.blackouts.apply_event(event),
            }
        }
        debug!(
            events = events.len(),
            reservations = engine.store.reservation_count(),
            blackouts = engine.blackouts.len(),
            "WAL replayed"
        );

        Ok(engine)
    }

    /// Whether the sweeper also moves confirmed reservations whose slot has
    /// passed to `completed`. On by default.
    pub fn complete_confirmed_on_sweep(mut self, enabled: bool) -> Self {
        self.complete_confirmed = enabled;
        self
    }

    pub(super) async fn lock_property(&self, ps: SharedPropertyState) -> PropertyLocks {
        let gate = Arc::clone(&self.commit_gate).read_owned().await;
        let property = ps.write_owned().await;
        PropertyLocks { _gate: gate, property }
    }

    /// Lookup reservation → property, then take the commit locks.
    pub(super) async fn lock_reservation(&self, id: Ulid) -> Result<PropertyLocks, EngineError> {
        let property_id = self.store.property_for(&id).ok_or(EngineError::NotFound(id))?;
        let ps = self
            .store
            .get_property(&property_id)
            .ok_or(EngineError::NotFound(id))?;
        let locks = self.lock_property(ps).await;
        if locks.property.get(id).is_none() {
            // Removed while we waited for the lock.
            return Err(EngineError::NotFound(id));
        }
        Ok(locks)
    }

    pub(super) async fn lock_blackouts(&self) -> BlackoutLocks {
        let writer = Arc::clone(&self.blackout_lock).lock_owned().await;
        let gate = Arc::clone(&self.commit_gate).read_owned().await;
        BlackoutLocks {
            _writer: writer,
            _gate: gate,
        }
    }

    pub(super) async fn lock_for_compaction(&self) -> OwnedRwLockWriteGuard<()> {
        Arc::clone(&self.commit_gate).write_owned().await
    }

    /// WAL append then in-memory apply, in a task that owns the locks.
    ///
    /// A caller that stops polling cannot split the two halves: the task runs
    /// to completion and releases the locks when it is done.
    pub(super) async fn commit(&self, locks: PropertyLocks, event: Event) -> Result<(), EngineError> {
        let wal_tx = self.wal_tx.clone();
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let mut locks = locks;
            append_event(&wal_tx, &event).await?;
            store.apply_event(&mut locks.property, &event);
            Ok::<(), EngineError>(())
        })
        .await
        .map_err(|e| EngineError::Transient(format!("commit task failed: {e}")))?
    }

    pub(super) async fn commit_blackout(&self, locks: BlackoutLocks, event: Event) -> Result<(), EngineError> {
        let wal_tx = self.wal_tx.clone();
        let blackouts = Arc::clone(&self.blackouts);
        tokio::spawn(async move {
            let _locks = locks;
            append_event(&wal_tx, &event).await?;
            blackouts.apply_event(&event);
            Ok::<(), EngineError>(())
        })
        .await
        .map_err(|e| EngineError::Transient(format!("commit task failed: {e}")))?
    }

    pub(super) async fn send_compact(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Transient("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Transient("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Transient(format!("WAL compaction failed: {e}")))
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
