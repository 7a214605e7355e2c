mod availability;
mod error;
mod index;
mod mutations;
mod policy;
mod queries;
mod store;

pub use availability::{
    blocked_windows, merge_overlapping, open_windows, partition_slots, resolve_windows,
    subtract_intervals, winning_rule,
};
pub use error::EngineError;
pub use policy::{system_clock, Clock};

use store::Store;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDateTime;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info};

use crate::model::Event;
use crate::notify::NotifyHub;
use crate::observability;
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

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it (the batch window).
/// 3. One fsync for the whole batch, then answer every sender.
/// 4. A control command found while draining runs after the flush.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_command(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        flush_and_respond(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_command(&mut wal, cmd);
        }
    }
    debug!("WAL writer stopped");
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<Pending>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so no half-buffered frame leaks
    // into the next batch.
    let flush_result = wal.flush_sync();
    match append_err {
        Some(e) => Err(e),
        None => flush_result,
    }
}

fn handle_command(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Append { event, response } => {
            flush_and_respond(wal, &mut vec![(event, response)]);
        }
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
    }
}

// ── Engine ───────────────────────────────────────────────

/// The reservation store and its consistency engine.
///
/// Every write goes claim → WAL → apply → notify. Unique keys are claimed
/// in memory before the WAL append, so two writers racing for one key can
/// never both reach the log.
pub struct Engine {
    store: Store,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Writers hold it shared across append+apply; compaction holds it
    /// exclusively so the snapshot never misses a flushed event.
    commit_gate: RwLock<()>,
    pub notify: Arc<NotifyHub>,
    clock: Clock,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the group-commit writer.
    /// Must be called inside a tokio runtime.
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Store::new();
        for event in &events {
            store.apply_event(event);
        }
        info!(
            wal = %wal_path.display(),
            events = events.len(),
            reservations = store.reservations.len(),
            "engine opened"
        );

        Ok(Self {
            store,
            wal_tx,
            commit_gate: RwLock::new(()),
            notify,
            clock: system_clock,
        })
    }

    /// Replace the source of "now" used by booking and cancellation policy.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> NaiveDateTime {
        (self.clock)()
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

    /// Persist, apply and broadcast one event.
    pub(super) async fn commit(&self, event: Event) -> Result<(), EngineError> {
        {
            let _gate = self.commit_gate.read().await;
            self.wal_append(&event).await?;
            self.store.apply_event(&event);
        }
        self.notify.send(&event);
        Ok(())
    }
}
