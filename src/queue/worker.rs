//! Flush worker: buffer swaps, batch execution and failure recovery.
//!
//! A single dedicated thread owns all storage I/O. It drains commands from a
//! channel; a periodic tick task (spawned by `start()`) feeds it `Cycle`
//! commands, and the forced-flush APIs feed it `FlushAll`/`FlushType` so
//! batch execution never overlaps itself.

use std::any::TypeId;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::backend::StorageBackend;
use crate::entity::{EntityKey, OperationKind, PendingOp};
use crate::queue::buffer::Side;
use crate::queue::Shared;
use crate::stats::{bump, bump_by};

/// Commands handled by the worker thread.
pub(crate) enum Command {
    /// One periodic cycle: swap, wait the grace window, drain the inactive
    /// side.
    Cycle,
    /// Drain both sides of every type, then ack.
    FlushAll { ack: oneshot::Sender<()> },
    /// Drain both sides of one type, then ack.
    FlushType {
        type_id: TypeId,
        ack: oneshot::Sender<()>,
    },
    /// Final flush (failures logged, not re-queued), ack, exit.
    Shutdown { ack: oneshot::Sender<()> },
}

/// What to do with items whose individual retry failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecoveryMode {
    /// Merge back into the active buffer for the next cycle.
    Requeue,
    /// Log and drop; used for the final flush when the process is going
    /// away and there will be no next cycle.
    LogOnly,
}

/// Worker thread entry point.
pub(crate) fn run(shared: Arc<Shared>, mut rx: mpsc::Receiver<Command>) {
    tracing::info!(
        interval_ms = shared.config.save_interval.as_millis() as u64,
        grace_ms = shared.config.switch_delay.as_millis() as u64,
        "flush worker started"
    );

    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            Command::Cycle => {
                cycle(&shared, RecoveryMode::Requeue);
                bump(&shared.stats.flush_cycles);
            }
            Command::FlushAll { ack } => {
                flush_all(&shared, RecoveryMode::Requeue);
                let _ = ack.send(());
            }
            Command::FlushType { type_id, ack } => {
                flush_type(&shared, type_id, RecoveryMode::Requeue);
                let _ = ack.send(());
            }
            Command::Shutdown { ack } => {
                tracing::info!("draining remaining mutations before shutdown");
                flush_all(&shared, RecoveryMode::LogOnly);
                let _ = ack.send(());
                break;
            }
        }
    }

    tracing::info!("flush worker stopped");
}

/// One flush cycle: swap the buffers, wait the grace window, then drain and
/// execute the now-inactive side.
pub(crate) fn cycle(shared: &Shared, mode: RecoveryMode) {
    let drained_side = {
        let mut inner = shared.inner.lock().unwrap();
        inner.swap()
    };

    // Margin against any writer that observed the old flag outside the lock.
    std::thread::sleep(shared.config.switch_delay);

    let batches = take_side(shared, drained_side);
    for batch in batches {
        batch.execute(shared, mode);
    }
}

/// Forced drain of everything: one ordinary cycle, then the remaining
/// (active) side, which may hold items re-queued by recovery moments ago.
pub(crate) fn flush_all(shared: &Shared, mode: RecoveryMode) {
    cycle(shared, mode);

    let side = shared.inner.lock().unwrap().active_side();
    let batches = take_side(shared, side);
    for batch in batches {
        batch.execute(shared, mode);
    }
}

/// Forced drain of both sides for a single entity type.
pub(crate) fn flush_type(shared: &Shared, type_id: TypeId, mode: RecoveryMode) {
    let batches = {
        let mut inner = shared.inner.lock().unwrap();
        let Some(slot) = inner.slots.get_mut(&type_id) else {
            return;
        };
        [Side::A, Side::B]
            .into_iter()
            .filter_map(|side| slot.take_batch(side))
            .collect::<Vec<_>>()
    };
    for batch in batches {
        batch.execute(shared, mode);
    }
}

fn take_side(shared: &Shared, side: Side) -> Vec<Box<dyn FlushBatch>> {
    let mut inner = shared.inner.lock().unwrap();
    inner
        .slots
        .values_mut()
        .filter_map(|slot| slot.take_batch(side))
        .collect()
}

/// A drained buffer for one entity type, executable against its backend.
pub(crate) trait FlushBatch: Send {
    fn execute(self: Box<Self>, shared: &Shared, mode: RecoveryMode);
}

pub(crate) struct TypedBatch<E> {
    backend: Arc<dyn StorageBackend<E>>,
    ops: Vec<(EntityKey, PendingOp<E>)>,
}

impl<E> TypedBatch<E> {
    pub fn new(backend: Arc<dyn StorageBackend<E>>, ops: Vec<(EntityKey, PendingOp<E>)>) -> Self {
        Self { backend, ops }
    }
}

impl<E: Send + Sync + 'static> FlushBatch for TypedBatch<E> {
    fn execute(self: Box<Self>, shared: &Shared, mode: RecoveryMode) {
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        let mut deletes = Vec::new();
        for entry in self.ops {
            match entry.1.kind {
                OperationKind::Insert => inserts.push(entry),
                OperationKind::Update => updates.push(entry),
                OperationKind::Delete => deletes.push(entry),
            }
        }

        execute_group(shared, &self.backend, OperationKind::Insert, inserts, mode);
        execute_group(shared, &self.backend, OperationKind::Update, updates, mode);
        execute_group(shared, &self.backend, OperationKind::Delete, deletes, mode);
    }
}

/// Submit one (type, kind) group as a bulk call; on failure retry item by
/// item and hand still-failing items to recovery.
fn execute_group<E: Send + Sync + 'static>(
    shared: &Shared,
    backend: &Arc<dyn StorageBackend<E>>,
    kind: OperationKind,
    group: Vec<(EntityKey, PendingOp<E>)>,
    mode: RecoveryMode,
) {
    if group.is_empty() {
        return;
    }

    let type_name = std::any::type_name::<E>();
    let entities: Vec<Arc<E>> = group.iter().map(|(_, op)| Arc::clone(&op.entity)).collect();

    bump(&shared.stats.batch_calls);
    let result = match kind {
        OperationKind::Insert => backend.batch_insert(&entities),
        OperationKind::Update => backend.batch_update(&entities),
        OperationKind::Delete => backend.batch_delete(&entities),
    };

    match result {
        Ok(()) => {
            bump_by(&shared.stats.persisted, group.len() as u64);
            tracing::debug!(
                entity = type_name,
                kind = ?kind,
                count = group.len(),
                "batch flushed"
            );
        }
        Err(err) => {
            bump(&shared.stats.batch_failures);
            tracing::warn!(
                entity = type_name,
                kind = ?kind,
                count = group.len(),
                error = %err,
                "bulk call failed, retrying items individually"
            );
            for (key, op) in group {
                retry_item(shared, backend, key, op, mode);
            }
        }
    }
}

fn retry_item<E: Send + Sync + 'static>(
    shared: &Shared,
    backend: &Arc<dyn StorageBackend<E>>,
    key: EntityKey,
    mut op: PendingOp<E>,
    mode: RecoveryMode,
) {
    let type_name = std::any::type_name::<E>();
    let result = match op.kind {
        OperationKind::Insert => backend.insert(&op.entity),
        OperationKind::Update => backend.update(&op.entity),
        OperationKind::Delete => backend.delete(&op.entity),
    };

    match result {
        Ok(()) => bump(&shared.stats.persisted),
        Err(err) => {
            bump(&shared.stats.item_failures);
            op.attempts += 1;
            match mode {
                RecoveryMode::LogOnly => {
                    tracing::error!(
                        entity = type_name,
                        key = ?key,
                        kind = ?op.kind,
                        error = %err,
                        "operation failed during final flush and will not be re-queued"
                    );
                }
                RecoveryMode::Requeue => {
                    tracing::error!(
                        entity = type_name,
                        key = ?key,
                        kind = ?op.kind,
                        attempts = op.attempts,
                        error = %err,
                        "individual retry failed"
                    );
                    requeue(shared, type_name, key, op);
                }
            }
        }
    }
}

/// Merge a failed operation into the current active buffer, or park it in
/// quarantine once its retry budget is spent.
fn requeue<E: Send + Sync + 'static>(
    shared: &Shared,
    type_name: &'static str,
    key: EntityKey,
    op: PendingOp<E>,
) {
    let mut inner = shared.inner.lock().unwrap();
    let side = inner.active_side();
    let Some(slot) = inner.slot_mut::<E>() else {
        return;
    };

    if let Some(max) = shared.config.max_item_retries {
        if op.attempts >= max {
            tracing::warn!(
                entity = type_name,
                key = ?key,
                kind = ?op.kind,
                attempts = op.attempts,
                "retry budget exhausted, moving operation to quarantine"
            );
            slot.quarantine_push(key, op);
            bump(&shared.stats.quarantined);
            return;
        }
    }

    slot.merge_failed(side, key, op);
    bump(&shared.stats.requeued);
}
