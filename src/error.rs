//! Error types for the queue and its storage backends.
//!
//! Storage failures are handled asynchronously inside the flush worker and
//! never surface to submitting threads; `QueueError` covers the synchronous,
//! caller-visible failures (registration, lifecycle, anomalous submissions).

use std::time::Duration;

use thiserror::Error;

use crate::entity::OperationKind;

/// Synchronous, caller-visible queue errors.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("entity type `{0}` is already registered")]
    AlreadyRegistered(&'static str),

    #[error("entity type `{0}` is not registered")]
    NotRegistered(&'static str),

    /// An `insert` was submitted for a key that is already queued as
    /// Insert or Update. The queued entry is left unchanged.
    #[error("a {existing:?} is already pending for this key of `{type_name}`")]
    AlreadyPending {
        type_name: &'static str,
        existing: OperationKind,
    },

    #[error("failed to spawn flush worker: {0}")]
    Spawn(String),

    #[error("flush worker is unavailable")]
    WorkerGone,

    #[error("flush worker did not stop within {0:?}")]
    StopTimeout(Duration),
}

/// Failure raised by a storage backend call.
///
/// Both bulk calls and single-item fallbacks are all-or-nothing: an error
/// means the whole call had no effect.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("unsupported entity key: {0}")]
    UnsupportedKey(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}

impl From<r2d2::Error> for StorageError {
    fn from(err: r2d2::Error) -> Self {
        StorageError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Database(format!("serialization failed: {err}"))
    }
}
