//! The write-back queue: registration, submissions, lifecycle and forced
//! flushes.
//!
//! Submissions coalesce into the active buffer under one coarse lock and
//! never perform I/O; a single background worker thread swaps buffers on a
//! fixed interval and pushes batches to the registered storage backends.

pub(crate) mod buffer;
pub(crate) mod worker;

use std::any::TypeId;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};

use crate::backend::StorageBackend;
use crate::config::QueueConfig;
use crate::entity::{EntityKey, OperationKind};
use crate::error::QueueError;
use crate::stats::{QueueStats, StatsSnapshot};
use crate::storage::sqlite::SqlRecord;

use buffer::{CoalesceOutcome, Inner, TypeSlot};
use worker::{Command, RecoveryMode};

/// State shared between the public handle and the flush worker.
pub(crate) struct Shared {
    pub config: QueueConfig,
    /// The single coarse lock: guards the active-side flag and every
    /// per-type buffer, making "select active buffer, mutate it" atomic
    /// relative to a swap.
    pub inner: Mutex<Inner>,
    pub stats: QueueStats,
}

struct WorkerRuntime {
    cmd_tx: mpsc::Sender<Command>,
    shutdown_tx: watch::Sender<bool>,
    ticker: tokio::task::JoinHandle<()>,
    thread: std::thread::JoinHandle<()>,
}

/// Asynchronous write-back persistence queue.
///
/// Accepts entity mutations in memory, coalesces repeated mutations on the
/// same logical record, and flushes them to storage in periodic batches.
/// Submitting threads never block on I/O; storage failures are retried and
/// re-queued by the background worker and never surface to submitters.
///
/// Entity payloads are shared handles, not snapshots: a flush reads the
/// entity's state at persist time. Entities mutated from multiple threads
/// need their own interior synchronization.
pub struct SaveQueue {
    shared: Arc<Shared>,
    runtime: Mutex<Option<WorkerRuntime>>,
}

impl SaveQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                inner: Mutex::new(Inner::new()),
                stats: QueueStats::default(),
            }),
            runtime: Mutex::new(None),
        }
    }

    /// Register an entity type keyed by handle identity: two clones of the
    /// same `Arc` coalesce, two separate allocations do not.
    pub fn register<E, B>(&self, backend: Arc<B>) -> Result<(), QueueError>
    where
        E: Send + Sync + 'static,
        B: StorageBackend<E>,
    {
        self.register_slot(TypeSlot::new(backend, None))
    }

    /// Register an entity type with a key extractor (typically the record's
    /// primary-key field).
    ///
    /// # Errors
    ///
    /// `AlreadyRegistered` if the type already has a backend.
    pub fn register_with_key<E, B, F>(&self, backend: Arc<B>, extractor: F) -> Result<(), QueueError>
    where
        E: Send + Sync + 'static,
        B: StorageBackend<E>,
        F: Fn(&E) -> EntityKey + Send + Sync + 'static,
    {
        let extractor: crate::entity::KeyExtractor<E> = Arc::new(extractor);
        self.register_slot(TypeSlot::new(backend, Some(extractor)))
    }

    /// Register a [`SqlRecord`] type, keyed by its `record_key`.
    pub fn register_record<E, B>(&self, backend: Arc<B>) -> Result<(), QueueError>
    where
        E: SqlRecord,
        B: StorageBackend<E>,
    {
        self.register_with_key(backend, E::record_key)
    }

    fn register_slot<E: Send + Sync + 'static>(&self, slot: TypeSlot<E>) -> Result<(), QueueError> {
        use std::collections::hash_map::Entry;

        let mut inner = self.shared.inner.lock().unwrap();
        match inner.slots.entry(TypeId::of::<E>()) {
            Entry::Occupied(_) => Err(QueueError::AlreadyRegistered(std::any::type_name::<E>())),
            Entry::Vacant(vacant) => {
                vacant.insert(Box::new(slot));
                Ok(())
            }
        }
    }

    /// Queue an entity for insertion.
    ///
    /// # Errors
    ///
    /// `AlreadyPending` if the key is already queued as Insert or Update;
    /// the queued entry is left unchanged. `NotRegistered` for unknown types.
    pub fn insert<E: Send + Sync + 'static>(&self, entity: Arc<E>) -> Result<(), QueueError> {
        self.enqueue(entity, OperationKind::Insert)
    }

    /// Queue an entity for update. Repeated updates for the same key
    /// coalesce into one.
    pub fn update<E: Send + Sync + 'static>(&self, entity: Arc<E>) -> Result<(), QueueError> {
        self.enqueue(entity, OperationKind::Update)
    }

    /// Queue an entity for deletion. Cancels a pending insert for the same
    /// key outright.
    pub fn delete<E: Send + Sync + 'static>(&self, entity: Arc<E>) -> Result<(), QueueError> {
        self.enqueue(entity, OperationKind::Delete)
    }

    /// Generic submission, kept for callers that do not distinguish insert
    /// from update; equivalent to [`SaveQueue::update`].
    pub fn submit<E: Send + Sync + 'static>(&self, entity: Arc<E>) -> Result<(), QueueError> {
        self.update(entity)
    }

    fn enqueue<E: Send + Sync + 'static>(
        &self,
        entity: Arc<E>,
        kind: OperationKind,
    ) -> Result<(), QueueError> {
        let type_name = std::any::type_name::<E>();
        let mut inner = self.shared.inner.lock().unwrap();
        let side = inner.active_side();
        let Some(slot) = inner.slot_mut::<E>() else {
            return Err(QueueError::NotRegistered(type_name));
        };
        let key = slot.resolve_key(&entity);
        match slot.coalesce(side, key, kind, entity) {
            CoalesceOutcome::AlreadyPending(existing) => {
                tracing::warn!(
                    entity = type_name,
                    existing = ?existing,
                    "insert submitted for a key that is already pending"
                );
                Err(QueueError::AlreadyPending {
                    type_name,
                    existing,
                })
            }
            _ => Ok(()),
        }
    }

    /// Start the periodic flush worker. Idempotent. Must be called from
    /// within a tokio runtime.
    ///
    /// # Errors
    ///
    /// `Spawn` if the worker thread cannot be created.
    pub fn start(&self) -> Result<(), QueueError> {
        let mut runtime = self.runtime.lock().unwrap();
        if runtime.is_some() {
            return Ok(());
        }

        if self.shared.config.thread_count > 1 {
            tracing::debug!(
                requested = self.shared.config.thread_count,
                "thread_count above one requested; flushing always runs on a single worker"
            );
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let shared = Arc::clone(&self.shared);
        let thread = std::thread::Builder::new()
            .name("writeback-flush".into())
            .spawn(move || worker::run(shared, cmd_rx))
            .map_err(|err| QueueError::Spawn(err.to_string()))?;

        let tick_tx = cmd_tx.clone();
        let interval = self.shared.config.save_interval;
        let ticker = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // A full channel means the worker is still busy with
                        // the previous cycle; skip this tick (fixed-delay
                        // semantics, no pile-up).
                        if let Err(TrySendError::Closed(_)) = tick_tx.try_send(Command::Cycle) {
                            break;
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        *runtime = Some(WorkerRuntime {
            cmd_tx,
            shutdown_tx,
            ticker,
            thread,
        });
        tracing::info!(
            interval_ms = interval.as_millis() as u64,
            "save queue started"
        );
        Ok(())
    }

    /// Stop the worker: halt scheduling, wait up to `stop_timeout` for the
    /// final flush, then join. The worker's last act is one synchronous
    /// flush of everything still queued; failures during that flush are
    /// logged but cannot be re-queued. No-op if not running.
    ///
    /// # Errors
    ///
    /// `StopTimeout` if the worker is stuck in a backend call past the
    /// configured timeout; the thread is detached in that case.
    pub async fn stop(&self) -> Result<(), QueueError> {
        let runtime = self.runtime.lock().unwrap().take();
        let Some(WorkerRuntime {
            cmd_tx,
            shutdown_tx,
            ticker,
            thread,
        }) = runtime
        else {
            return Ok(());
        };

        let _ = shutdown_tx.send(true);

        let (ack, ack_rx) = oneshot::channel();
        if cmd_tx.send(Command::Shutdown { ack }).await.is_ok() {
            let timeout = self.shared.config.stop_timeout;
            if tokio::time::timeout(timeout, ack_rx).await.is_err() {
                tracing::error!(
                    timeout_ms = timeout.as_millis() as u64,
                    "flush worker did not finish its final flush in time, detaching"
                );
                ticker.abort();
                return Err(QueueError::StopTimeout(timeout));
            }
        }

        ticker.abort();
        // The worker already acked its final flush; this join is prompt.
        let _ = tokio::task::spawn_blocking(move || thread.join()).await;
        tracing::info!("save queue stopped");
        Ok(())
    }

    /// Whether the flush worker is running.
    pub fn is_running(&self) -> bool {
        self.runtime.lock().unwrap().is_some()
    }

    /// Drain and persist both buffers immediately, for every entity type.
    /// Routed through the worker when running so batch I/O never overlaps;
    /// executed on a blocking task otherwise.
    ///
    /// # Errors
    ///
    /// `WorkerGone` if the worker disappeared mid-flush.
    pub async fn flush_all(&self) -> Result<(), QueueError> {
        match self.cmd_sender() {
            Some(tx) => {
                let (ack, ack_rx) = oneshot::channel();
                tx.send(Command::FlushAll { ack })
                    .await
                    .map_err(|_| QueueError::WorkerGone)?;
                ack_rx.await.map_err(|_| QueueError::WorkerGone)
            }
            None => {
                let shared = Arc::clone(&self.shared);
                tokio::task::spawn_blocking(move || {
                    worker::flush_all(&shared, RecoveryMode::Requeue);
                })
                .await
                .map_err(|_| QueueError::WorkerGone)
            }
        }
    }

    /// Drain and persist both buffers immediately for one entity type.
    ///
    /// # Errors
    ///
    /// `NotRegistered` if the type has no backend; `WorkerGone` if the
    /// worker disappeared mid-flush.
    pub async fn flush_entity_type<E: Send + Sync + 'static>(&self) -> Result<(), QueueError> {
        let type_id = TypeId::of::<E>();
        if !self.shared.inner.lock().unwrap().slots.contains_key(&type_id) {
            return Err(QueueError::NotRegistered(std::any::type_name::<E>()));
        }

        match self.cmd_sender() {
            Some(tx) => {
                let (ack, ack_rx) = oneshot::channel();
                tx.send(Command::FlushType { type_id, ack })
                    .await
                    .map_err(|_| QueueError::WorkerGone)?;
                ack_rx.await.map_err(|_| QueueError::WorkerGone)
            }
            None => {
                let shared = Arc::clone(&self.shared);
                tokio::task::spawn_blocking(move || {
                    worker::flush_type(&shared, type_id, RecoveryMode::Requeue);
                })
                .await
                .map_err(|_| QueueError::WorkerGone)
            }
        }
    }

    fn cmd_sender(&self) -> Option<mpsc::Sender<Command>> {
        self.runtime
            .lock()
            .unwrap()
            .as_ref()
            .map(|rt| rt.cmd_tx.clone())
    }

    /// Operations currently queued across both buffers of every type.
    pub fn pending_len(&self) -> usize {
        let inner = self.shared.inner.lock().unwrap();
        inner.slots.values().map(|slot| slot.pending_len()).sum()
    }

    /// Items parked in quarantine after exhausting their retry budget.
    pub fn quarantined_len(&self) -> usize {
        let inner = self.shared.inner.lock().unwrap();
        inner
            .slots
            .values()
            .map(|slot| slot.quarantined_len())
            .sum()
    }

    /// Point-in-time counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }
}

impl Default for SaveQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}
