//! SQLite storage backend.
//!
//! One table per record type, declared by a static descriptor rather than
//! runtime reflection: `(pk PRIMARY KEY, data TEXT)` with the record body
//! serialized as JSON. Bulk calls run inside a single transaction, so the
//! all-or-nothing backend contract holds. Connections come from an r2d2
//! pool; SQLite WAL mode allows readers to proceed while the flush worker
//! writes.

use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value;
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::backend::StorageBackend;
use crate::entity::EntityKey;
use crate::error::StorageError;

/// Static persistence descriptor for a record type.
///
/// `record_key` doubles as the queue's key extractor when registering via
/// [`crate::SaveQueue::register_record`]. Identity keys are not storable and
/// are rejected at flush time.
pub trait SqlRecord: Serialize + Send + Sync + 'static {
    /// Table this record type persists to.
    const TABLE: &'static str;

    /// Primary key of this record.
    fn record_key(&self) -> EntityKey;
}

/// [`StorageBackend`] over a pooled SQLite database.
pub struct SqliteBackend<E> {
    pool: Pool<SqliteConnectionManager>,
    _marker: PhantomData<fn() -> E>,
}

impl<E: SqlRecord> SqliteBackend<E> {
    /// Open (or create) the database at `db_path` with a pool of `pool_size`
    /// connections, applying durability pragmas to each.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be created.
    pub fn open<P: AsRef<Path>>(db_path: P, pool_size: u32) -> Result<Self, StorageError> {
        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            apply_pragmas(conn)?;
            Ok(())
        });
        let pool = Pool::builder().max_size(pool_size).build(manager)?;
        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool (shared with other backends of the same
    /// database).
    pub fn from_pool(pool: Pool<SqliteConnectionManager>) -> Self {
        Self {
            pool,
            _marker: PhantomData,
        }
    }

    /// Create the record's table if it does not exist.
    pub fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.pool.get()?;
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (pk TEXT PRIMARY KEY, data TEXT NOT NULL)",
                E::TABLE
            ),
            [],
        )?;
        Ok(())
    }

    /// Number of rows currently in the record's table.
    pub fn count(&self) -> Result<i64, StorageError> {
        let conn = self.pool.get()?;
        let count = conn.query_row(&format!("SELECT COUNT(*) FROM {}", E::TABLE), [], |row| {
            row.get(0)
        })?;
        Ok(count)
    }

    fn run_bulk(&self, entities: &[Arc<E>], sql: &str, with_body: bool) -> Result<(), StorageError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(sql)?;
            for entity in entities {
                let pk = key_to_sql(&entity.record_key())?;
                if with_body {
                    let body = serde_json::to_string(entity.as_ref())?;
                    stmt.execute(params![pk, body])?;
                } else {
                    stmt.execute(params![pk])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn run_single(&self, entity: &E, sql: &str, with_body: bool) -> Result<(), StorageError> {
        let conn = self.pool.get()?;
        let pk = key_to_sql(&entity.record_key())?;
        if with_body {
            let body = serde_json::to_string(entity)?;
            conn.execute(sql, params![pk, body])?;
        } else {
            conn.execute(sql, params![pk])?;
        }
        Ok(())
    }

    fn insert_sql() -> String {
        format!("INSERT INTO {} (pk, data) VALUES (?1, ?2)", E::TABLE)
    }

    fn update_sql() -> String {
        format!("UPDATE {} SET data = ?2 WHERE pk = ?1", E::TABLE)
    }

    fn delete_sql() -> String {
        format!("DELETE FROM {} WHERE pk = ?1", E::TABLE)
    }
}

impl<E: SqlRecord> StorageBackend<E> for SqliteBackend<E> {
    fn batch_insert(&self, entities: &[Arc<E>]) -> Result<(), StorageError> {
        self.run_bulk(entities, &Self::insert_sql(), true)
    }

    fn batch_update(&self, entities: &[Arc<E>]) -> Result<(), StorageError> {
        self.run_bulk(entities, &Self::update_sql(), true)
    }

    fn batch_delete(&self, entities: &[Arc<E>]) -> Result<(), StorageError> {
        self.run_bulk(entities, &Self::delete_sql(), false)
    }

    fn insert(&self, entity: &E) -> Result<(), StorageError> {
        self.run_single(entity, &Self::insert_sql(), true)
    }

    fn update(&self, entity: &E) -> Result<(), StorageError> {
        self.run_single(entity, &Self::update_sql(), true)
    }

    fn delete(&self, entity: &E) -> Result<(), StorageError> {
        self.run_single(entity, &Self::delete_sql(), false)
    }
}

fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    // journal_mode reports the resulting mode as a row; read it instead of
    // using pragma_update.
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(())
}

fn key_to_sql(key: &EntityKey) -> Result<Value, StorageError> {
    match key {
        EntityKey::Int(v) => Ok(Value::Integer(*v)),
        EntityKey::Text(s) => Ok(Value::Text(s.clone())),
        EntityKey::Bytes(b) => Ok(Value::Blob(b.clone())),
        EntityKey::Identity(_) => Err(StorageError::UnsupportedKey(
            "identity keys cannot be stored; register the type with a key extractor".into(),
        )),
    }
}
