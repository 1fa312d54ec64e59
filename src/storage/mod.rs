//! Provided storage backends.
//!
//! The queue only requires the [`crate::StorageBackend`] trait; this module
//! ships a ready-made SQLite implementation for applications that do not
//! bring their own storage layer.

pub mod sqlite;
