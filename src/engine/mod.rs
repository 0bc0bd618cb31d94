pub mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod store;

pub(crate) use conflict::{now_ms, today};
pub use error::EngineError;
pub use mutations::HoldExpiry;
pub use queries::CheckOptions;
pub use store::UnitStore;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::warn;
use ulid::Ulid;

use crate::cache::AvailabilityCache;
use crate::config::EngineConfig;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedUnitState = Arc<RwLock<UnitState>>;

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
/// 4. Single fsync for the whole batch; a failure truncates the batch away.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            // Flush what we have before compaction or stats see the log.
                            deferred = Some(other);
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
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    // All-or-nothing: a failed batch is cut back off the log before the next
    // one is written, so its callers' errors match what replay will see.
    wal.append_batch(batch.iter().map(|(event, _)| event))
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
            let result = wal.append_batch(std::iter::once(&event));
            let _ = response.send(result);
        }
    }
}

/// One tenant's availability engine: unit state, WAL, change feed and cache.
pub struct Engine {
    pub(super) store: UnitStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) cache: Arc<AvailabilityCache>,
    pub(super) config: EngineConfig,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        cache: Arc<AvailabilityCache>,
        config: EngineConfig,
    ) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: UnitStore::new(),
            wal_tx,
            notify,
            cache,
            config,
        };

        // We're the sole owner of these Arcs during replay, so try_write always
        // succeeds. Never block here: this may run inside lazy tenant creation.
        for event in &events {
            let us = match event {
                Event::UnitUpserted {
                    id,
                    name,
                    nightly_rate,
                    active,
                } => engine.store.insert_unit(Unit {
                    id: *id,
                    name: name.clone(),
                    nightly_rate: *nightly_rate,
                    active: *active,
                }),
                other => match engine.store.get_unit(&other.unit_id()) {
                    Some(us) => us,
                    None => {
                        warn!("replay: event for unknown unit {}, skipped", other.unit_id());
                        continue;
                    }
                },
            };
            let mut guard = us
                .try_write()
                .map_err(|_| io::Error::other("replay: unit state unexpectedly locked"))?;
            engine.store.apply_event(&mut guard, event);
        }

        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<AvailabilityCache> {
        &self.cache
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
            .map_err(|_| EngineError::Infrastructure("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Infrastructure("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Infrastructure(format!("WAL: {e}")))
    }

    pub(super) async fn lock_unit_write(&self, unit_id: Ulid) -> Result<OwnedRwLockWriteGuard<UnitState>, EngineError> {
        let us = self.store.get_unit(&unit_id).ok_or(EngineError::NotFound(unit_id))?;
        let guard = tokio::time::timeout(self.config.lock_timeout, us.clone().write_owned())
            .await
            .map_err(|_| {
                warn!("write lock timeout on unit {unit_id}");
                EngineError::LockTimeout(unit_id)
            })?;
        // A unit whose creation failed is removed while its creator still
        // holds the lock; anyone who queued behind it must not write to it.
        if !self.store.is_current(&unit_id, &us) {
            return Err(EngineError::NotFound(unit_id));
        }
        Ok(guard)
    }

    pub(super) async fn lock_unit_read(&self, unit_id: Ulid) -> Result<OwnedRwLockReadGuard<UnitState>, EngineError> {
        let us = self.store.get_unit(&unit_id).ok_or(EngineError::NotFound(unit_id))?;
        let guard = tokio::time::timeout(self.config.lock_timeout, us.clone().read_owned())
            .await
            .map_err(|_| {
                warn!("read lock timeout on unit {unit_id}");
                EngineError::LockTimeout(unit_id)
            })?;
        if !self.store.is_current(&unit_id, &us) {
            return Err(EngineError::NotFound(unit_id));
        }
        Ok(guard)
    }

    /// WAL-append + apply + invalidate + notify, all while the caller holds
    /// the unit's write lock. The record is durable before memory changes.
    pub(super) async fn persist_and_apply(
        &self,
        unit_id: Ulid,
        us: &mut UnitState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_event(us, event);
        self.cache.invalidate(&unit_id);
        self.notify.send(unit_id, event);
        Ok(())
    }

    /// Lookup entity → unit, then acquire that unit's write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<UnitState>), EngineError> {
        let unit_id = self
            .store
            .unit_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let guard = self.lock_unit_write(unit_id).await?;
        Ok((unit_id, guard))
    }

    async fn resolve_entity_read(&self, entity_id: &Ulid) -> Result<OwnedRwLockReadGuard<UnitState>, EngineError> {
        let unit_id = self
            .store
            .unit_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        self.lock_unit_read(unit_id).await
    }
}
