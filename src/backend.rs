//! Storage backend contract.
//!
//! The queue consumes storage through this narrow interface; table mapping,
//! SQL generation and connection management live behind it.

use std::sync::Arc;

use crate::error::StorageError;

/// Bulk and single-item persistence operations for one entity type.
///
/// Every call is all-or-nothing: on `Err` the backend must not have applied
/// any part of the call. Partial-success reporting is not supported; when a
/// bulk call fails the queue falls back to the single-item operations to
/// isolate the failing records.
///
/// Calls are issued from the single flush worker and never overlap each
/// other. A call that hangs stalls all future flush cycles, so backends
/// should carry their own I/O timeouts if the transport can wedge.
pub trait StorageBackend<E>: Send + Sync + 'static {
    /// Persist a group of new records as one bulk call.
    fn batch_insert(&self, entities: &[Arc<E>]) -> Result<(), StorageError>;

    /// Persist a group of modified records as one bulk call.
    fn batch_update(&self, entities: &[Arc<E>]) -> Result<(), StorageError>;

    /// Remove a group of records as one bulk call.
    fn batch_delete(&self, entities: &[Arc<E>]) -> Result<(), StorageError>;

    /// Single-item fallback for a failed bulk insert.
    fn insert(&self, entity: &E) -> Result<(), StorageError>;

    /// Single-item fallback for a failed bulk update.
    fn update(&self, entity: &E) -> Result<(), StorageError>;

    /// Single-item fallback for a failed bulk delete.
    fn delete(&self, entity: &E) -> Result<(), StorageError>;
}
