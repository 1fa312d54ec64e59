//! Test fixtures: in-memory mock backend with scripted failures, plus test
//! entity types.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use writeback::{EntityKey, StorageBackend, StorageError};

/// Minimal record interface so one mock backend serves several test entity
/// types.
pub trait TestRecord: Send + Sync + 'static {
    fn id(&self) -> i64;
    fn snapshot(&self) -> String;
}

/// Test entity with an interior-mutable field, to exercise live-reference
/// semantics.
pub struct Player {
    pub id: i64,
    pub name: Mutex<String>,
}

impl Player {
    pub fn new(id: i64, name: &str) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: Mutex::new(name.to_owned()),
        })
    }

    pub fn rename(&self, name: &str) {
        *self.name.lock().unwrap() = name.to_owned();
    }
}

impl TestRecord for Player {
    fn id(&self) -> i64 {
        self.id
    }

    fn snapshot(&self) -> String {
        self.name.lock().unwrap().clone()
    }
}

pub fn player_key(p: &Player) -> EntityKey {
    EntityKey::Int(p.id)
}

/// Second entity type for per-type flush tests.
pub struct Guild {
    pub id: i64,
    pub name: Mutex<String>,
}

impl Guild {
    pub fn new(id: i64, name: &str) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: Mutex::new(name.to_owned()),
        })
    }
}

impl TestRecord for Guild {
    fn id(&self) -> i64 {
        self.id
    }

    fn snapshot(&self) -> String {
        self.name.lock().unwrap().clone()
    }
}

pub fn guild_key(g: &Guild) -> EntityKey {
    EntityKey::Int(g.id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    BatchInsert,
    BatchUpdate,
    BatchDelete,
    Insert,
    Update,
    Delete,
}

/// One backend invocation with the record ids it carried.
#[derive(Debug, Clone)]
pub struct Call {
    pub kind: CallKind,
    pub ids: Vec<i64>,
}

/// In-memory backend double.
///
/// Failure scripting:
/// - `fail_next(n)` makes the next `n` calls (bulk or single) fail;
/// - `poison(id)` makes every call touching that id fail until `unpoison`.
///
/// Both bulk and single calls are all-or-nothing: a failing call applies
/// nothing.
#[derive(Default)]
pub struct MockBackend {
    state: Mutex<HashMap<i64, String>>,
    calls: Mutex<Vec<Call>>,
    fail_remaining: AtomicU32,
    poisoned: Mutex<HashSet<i64>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self, n: u32) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    pub fn poison(&self, id: i64) {
        self.poisoned.lock().unwrap().insert(id);
    }

    pub fn unpoison(&self, id: i64) {
        self.poisoned.lock().unwrap().remove(&id);
    }

    /// Last persisted value for a record, if any.
    pub fn stored(&self, id: i64) -> Option<String> {
        self.state.lock().unwrap().get(&id).cloned()
    }

    pub fn stored_len(&self) -> usize {
        self.state.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn take_failure(&self) -> bool {
        self.fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn is_poisoned(&self, id: i64) -> bool {
        self.poisoned.lock().unwrap().contains(&id)
    }

    fn apply_batch<E: TestRecord>(
        &self,
        kind: CallKind,
        entities: &[Arc<E>],
    ) -> Result<(), StorageError> {
        let ids: Vec<i64> = entities.iter().map(|e| e.id()).collect();
        self.calls.lock().unwrap().push(Call {
            kind,
            ids: ids.clone(),
        });

        if self.take_failure() {
            return Err(StorageError::Unavailable("scripted failure".into()));
        }
        if ids.iter().any(|id| self.is_poisoned(*id)) {
            return Err(StorageError::Database("poisoned record in batch".into()));
        }

        let mut state = self.state.lock().unwrap();
        for entity in entities {
            match kind {
                CallKind::BatchInsert | CallKind::BatchUpdate => {
                    state.insert(entity.id(), entity.snapshot());
                }
                CallKind::BatchDelete => {
                    state.remove(&entity.id());
                }
                _ => unreachable!("single kinds never reach apply_batch"),
            }
        }
        Ok(())
    }

    fn apply_single<E: TestRecord>(&self, kind: CallKind, entity: &E) -> Result<(), StorageError> {
        self.calls.lock().unwrap().push(Call {
            kind,
            ids: vec![entity.id()],
        });

        if self.take_failure() {
            return Err(StorageError::Unavailable("scripted failure".into()));
        }
        if self.is_poisoned(entity.id()) {
            return Err(StorageError::Database("poisoned record".into()));
        }

        let mut state = self.state.lock().unwrap();
        match kind {
            CallKind::Insert | CallKind::Update => {
                state.insert(entity.id(), entity.snapshot());
            }
            CallKind::Delete => {
                state.remove(&entity.id());
            }
            _ => unreachable!("batch kinds never reach apply_single"),
        }
        Ok(())
    }
}

impl<E: TestRecord> StorageBackend<E> for MockBackend {
    fn batch_insert(&self, entities: &[Arc<E>]) -> Result<(), StorageError> {
        self.apply_batch(CallKind::BatchInsert, entities)
    }

    fn batch_update(&self, entities: &[Arc<E>]) -> Result<(), StorageError> {
        self.apply_batch(CallKind::BatchUpdate, entities)
    }

    fn batch_delete(&self, entities: &[Arc<E>]) -> Result<(), StorageError> {
        self.apply_batch(CallKind::BatchDelete, entities)
    }

    fn insert(&self, entity: &E) -> Result<(), StorageError> {
        self.apply_single(CallKind::Insert, entity)
    }

    fn update(&self, entity: &E) -> Result<(), StorageError> {
        self.apply_single(CallKind::Update, entity)
    }

    fn delete(&self, entity: &E) -> Result<(), StorageError> {
        self.apply_single(CallKind::Delete, entity)
    }
}

/// Wait for a condition to become true with timeout.
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Initialize tracing for tests (only logs errors).
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("error")
        .with_test_writer()
        .try_init();
}
