//! Double-buffered mutation storage and the coalescing rules.
//!
//! One [`Inner`] sits behind the queue's single coarse lock and holds, per
//! registered entity type, a [`TypeSlot`] with two key-indexed buffers. The
//! flag on `Inner` selects the active side for every type at once, which is
//! what makes "pick active buffer, mutate it" atomic relative to a swap.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::StorageBackend;
use crate::entity::{EntityKey, KeyExtractor, OperationKind, PendingOp};
use crate::queue::worker::{FlushBatch, TypedBatch};

/// Which of the two buffers an operation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    A,
    B,
}

/// Result of applying a submission to the active buffer.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CoalesceOutcome {
    /// The entry was created or overwritten.
    Queued,
    /// An insert cancelled out a pending insert; the entry is gone.
    Cancelled,
    /// The submission changed nothing (payload is live through the shared
    /// handle, or a pending delete takes precedence).
    Ignored,
    /// `insert` hit a key already queued with the given kind.
    AlreadyPending(OperationKind),
}

/// Lock-guarded state: the active-side flag plus one slot per entity type.
pub(crate) struct Inner {
    using_a: bool,
    pub slots: HashMap<TypeId, Box<dyn AnySlot>>,
}

impl Inner {
    pub fn new() -> Self {
        Self {
            using_a: true,
            slots: HashMap::new(),
        }
    }

    pub fn active_side(&self) -> Side {
        if self.using_a {
            Side::A
        } else {
            Side::B
        }
    }

    /// Flip the active flag, returning the side that was active and must now
    /// be drained.
    pub fn swap(&mut self) -> Side {
        let drained = self.active_side();
        self.using_a = !self.using_a;
        drained
    }

    pub fn slot_mut<E: Send + Sync + 'static>(&mut self) -> Option<&mut TypeSlot<E>> {
        self.slots
            .get_mut(&TypeId::of::<E>())
            .and_then(|slot| slot.as_any_mut().downcast_mut::<TypeSlot<E>>())
    }
}

/// Object-safe view of a [`TypeSlot`] so `Inner` can hold mixed entity types.
pub(crate) trait AnySlot: Send {
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Move all operations on one side out as an executable batch.
    fn take_batch(&mut self, side: Side) -> Option<Box<dyn FlushBatch>>;

    /// Queued operations across both sides.
    fn pending_len(&self) -> usize;

    /// Items parked after exhausting their retry budget.
    fn quarantined_len(&self) -> usize;
}

/// Per-entity-type state: backend, key extractor and the two buffers.
pub(crate) struct TypeSlot<E> {
    backend: Arc<dyn StorageBackend<E>>,
    extractor: Option<KeyExtractor<E>>,
    buf_a: HashMap<EntityKey, PendingOp<E>>,
    buf_b: HashMap<EntityKey, PendingOp<E>>,
    quarantine: Vec<(EntityKey, PendingOp<E>)>,
}

impl<E: Send + Sync + 'static> TypeSlot<E> {
    pub fn new(backend: Arc<dyn StorageBackend<E>>, extractor: Option<KeyExtractor<E>>) -> Self {
        Self {
            backend,
            extractor,
            buf_a: HashMap::new(),
            buf_b: HashMap::new(),
            quarantine: Vec::new(),
        }
    }

    /// Resolve the key for an entity handle: registered extractor, or the
    /// handle's own identity when none was configured.
    pub fn resolve_key(&self, entity: &Arc<E>) -> EntityKey {
        match &self.extractor {
            Some(extract) => extract(entity),
            None => EntityKey::identity_of(entity),
        }
    }

    fn side_map(&mut self, side: Side) -> &mut HashMap<EntityKey, PendingOp<E>> {
        match side {
            Side::A => &mut self.buf_a,
            Side::B => &mut self.buf_b,
        }
    }

    /// Merge a new submission into the given buffer side.
    ///
    /// Transition table, `existing` row by incoming column:
    ///
    /// | existing | insert           | update   | delete  |
    /// |----------|------------------|----------|---------|
    /// | (none)   | Insert           | Update   | Delete  |
    /// | Insert   | already-pending  | no-op    | remove  |
    /// | Update   | already-pending  | Update   | Delete  |
    /// | Delete   | Insert           | no-op    | no-op   |
    pub fn coalesce(
        &mut self,
        side: Side,
        key: EntityKey,
        kind: OperationKind,
        entity: Arc<E>,
    ) -> CoalesceOutcome {
        use OperationKind::{Delete, Insert, Update};

        let map = self.side_map(side);
        let existing = map.get(&key).map(|op| op.kind);
        match (existing, kind) {
            (None, _) | (Some(Delete), Insert) => {
                map.insert(key, PendingOp::new(kind, entity));
                CoalesceOutcome::Queued
            }
            (Some(existing @ (Insert | Update)), Insert) => {
                CoalesceOutcome::AlreadyPending(existing)
            }
            // Pending insert already carries the live handle; the caller's
            // field changes are visible at flush time without a new entry.
            (Some(Insert), Update) => CoalesceOutcome::Ignored,
            (Some(Insert), Delete) => {
                map.remove(&key);
                CoalesceOutcome::Cancelled
            }
            (Some(Update), Update | Delete) => {
                map.insert(key, PendingOp::new(kind, entity));
                CoalesceOutcome::Queued
            }
            (Some(Delete), Update | Delete) => CoalesceOutcome::Ignored,
        }
    }

    /// Merge an operation whose individual retry failed back into the given
    /// (active) buffer side.
    ///
    /// | active existing | failed Insert | failed Update | failed Delete |
    /// |-----------------|---------------|---------------|---------------|
    /// | (none)          | put           | put           | put           |
    /// | Insert          | put           | keep Insert   | remove        |
    /// | Update          | put           | put           | put           |
    /// | Delete          | put           | keep Delete   | keep Delete   |
    pub fn merge_failed(&mut self, side: Side, key: EntityKey, op: PendingOp<E>) {
        use OperationKind::{Delete, Insert, Update};

        let map = self.side_map(side);
        let existing = map.get(&key).map(|queued| queued.kind);
        match (existing, op.kind) {
            (None, _) | (_, Insert) | (Some(Update), Update | Delete) => {
                map.insert(key, op);
            }
            // A fresh insert supersedes the failed delete.
            (Some(Insert), Delete) => {
                map.remove(&key);
            }
            // Pending insert must still happen; pending delete makes a stale
            // update or delete retry moot.
            (Some(Insert), Update) | (Some(Delete), Update | Delete) => {}
        }
    }

    pub fn quarantine_push(&mut self, key: EntityKey, op: PendingOp<E>) {
        self.quarantine.push((key, op));
    }

    #[cfg(test)]
    fn queued_kind(&mut self, side: Side, key: &EntityKey) -> Option<OperationKind> {
        self.side_map(side).get(key).map(|op| op.kind)
    }
}

impl<E: Send + Sync + 'static> AnySlot for TypeSlot<E> {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn take_batch(&mut self, side: Side) -> Option<Box<dyn FlushBatch>> {
        let map = self.side_map(side);
        if map.is_empty() {
            return None;
        }
        let ops: Vec<(EntityKey, PendingOp<E>)> = map.drain().collect();
        Some(Box::new(TypedBatch::new(Arc::clone(&self.backend), ops)))
    }

    fn pending_len(&self) -> usize {
        self.buf_a.len() + self.buf_b.len()
    }

    fn quarantined_len(&self) -> usize {
        self.quarantine.len()
    }
}
