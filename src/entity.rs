//! Pending-operation model: entity keys, operation kinds and queued entries.

use std::sync::Arc;

/// Kind of mutation queued for a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

/// Stable identifier distinguishing records of one entity type.
///
/// Keys are produced by the extractor registered for the type. Types
/// registered without an extractor fall back to the identity of the shared
/// entity handle, which stays stable for the queued lifetime because the
/// queue keeps the handle alive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKey {
    /// Address of the shared handle (default when no extractor is set).
    Identity(usize),
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl From<i64> for EntityKey {
    fn from(value: i64) -> Self {
        EntityKey::Int(value)
    }
}

impl From<String> for EntityKey {
    fn from(value: String) -> Self {
        EntityKey::Text(value)
    }
}

impl From<&str> for EntityKey {
    fn from(value: &str) -> Self {
        EntityKey::Text(value.to_owned())
    }
}

impl EntityKey {
    /// Derive the identity key of a shared entity handle.
    pub fn identity_of<E>(entity: &Arc<E>) -> Self {
        EntityKey::Identity(Arc::as_ptr(entity) as usize)
    }
}

/// Extractor mapping an entity to its key. Must be deterministic and stable
/// across the entity's queued lifetime.
pub type KeyExtractor<E> = Arc<dyn Fn(&E) -> EntityKey + Send + Sync>;

/// A queued mutation for one record.
///
/// The entity handle is live, not a snapshot: the flush reads the entity's
/// current state, so field mutations performed after submission are visible
/// at persist time.
#[derive(Debug)]
pub(crate) struct PendingOp<E> {
    pub kind: OperationKind,
    pub entity: Arc<E>,
    /// Individual retry failures so far (see the recovery merge rules).
    pub attempts: u32,
}

impl<E> PendingOp<E> {
    pub fn new(kind: OperationKind, entity: Arc<E>) -> Self {
        Self {
            kind,
            entity,
            attempts: 0,
        }
    }
}
