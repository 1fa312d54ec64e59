//! Writeback: an asynchronous write-back persistence queue.
//!
//! Decouples latency-sensitive threads from slow storage: entity mutations
//! are accepted in memory, repeated mutations on the same logical record are
//! coalesced, and a single background worker flushes them to a storage
//! backend in periodic batches.
//!
//! # Guarantees
//!
//! - Submissions never block on I/O; they contend only on one short
//!   in-memory critical section.
//! - No mutation is silently lost: failed batches fall back to single-item
//!   retries, and items that still fail are merged back into the live
//!   buffer for the next cycle.
//! - Entity payloads are live shared handles, not snapshots; a flush
//!   persists the entity's state at flush time.
//!
//! # Modules
//!
//! - [`backend`]: the storage backend contract (bulk + single-item calls)
//! - [`config`]: queue configuration
//! - [`entity`]: entity keys and the pending-operation model
//! - [`error`]: queue and storage error types
//! - [`queue`]: the [`SaveQueue`] itself
//! - [`stats`]: queue counters
//! - [`storage`]: provided SQLite backend

// Lint configuration
#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions, // queue::SaveQueue is fine
    clippy::must_use_candidate,      // Not all functions need #[must_use]
    clippy::missing_errors_doc,      // Error docs can be verbose
    clippy::missing_panics_doc       // Lock poisoning is the only panic path
)]

pub mod backend;
pub mod config;
pub mod entity;
pub mod error;
pub mod queue;
pub mod stats;
pub mod storage;

pub use backend::StorageBackend;
pub use config::QueueConfig;
pub use entity::{EntityKey, OperationKind};
pub use error::{QueueError, StorageError};
pub use queue::SaveQueue;
pub use stats::StatsSnapshot;
pub use storage::sqlite::{SqlRecord, SqliteBackend};
