//! Shared write discipline for every component.
//!
//! [`Store`] owns the connection pool, the in-process locks, and the event
//! bus. Components never open transactions themselves; they hand a closure
//! to [`Store::write`] under one of the `with_*_lock` wrappers.
//!
//! INVARIANT: lock order is entity lock → ledger lock → `SQLite` write lock.
//! Nothing takes the ledger lock and then an entity lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::debug;

use hserver_core::{DomainEvent, EventBus};

use crate::errors::{EngineError, Result};
use crate::sqlite::connection::{ConnectionPool, PooledConnection};

/// Connection pool plus the locks that serialize writers.
pub struct Store {
    pool: ConnectionPool,
    ledger_write_lock: Mutex<()>,
    entity_write_locks: Mutex<HashMap<String, Weak<Mutex<()>>>>,
    bus: Arc<EventBus>,
}

impl Store {
    const SQLITE_BUSY_MAX_RETRIES: u32 = 32;

    /// Wrap a pool whose schema is already migrated.
    pub fn new(pool: ConnectionPool, bus: Arc<EventBus>) -> Self {
        Self {
            pool,
            ledger_write_lock: Mutex::new(()),
            entity_write_locks: Mutex::new(HashMap::new()),
            bus,
        }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// The bus events are published on.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Get a connection from the pool.
    pub(crate) fn conn(&self) -> Result<PooledConnection> {
        Ok(self.pool.get()?)
    }

    /// Run a read on a pooled connection.
    pub(crate) fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn()?;
        f(&conn)
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction. Commits on `Ok`,
    /// rolls back on `Err`.
    pub(crate) fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let conn = self.conn()?;
        let tx = Transaction::new_unchecked(&conn, TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Deliver events produced by committed work.
    pub(crate) fn publish(&self, events: &[DomainEvent]) {
        self.bus.publish(events);
    }

    fn lock_ledger_write(&self) -> Result<MutexGuard<'_, ()>> {
        self.ledger_write_lock
            .lock()
            .map_err(|_| EngineError::Internal("ledger write lock poisoned".into()))
    }

    fn acquire_entity_write_lock(&self, key: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .entity_write_locks
            .lock()
            .map_err(|_| EngineError::Internal("entity lock map poisoned".into()))?;

        // Opportunistically prune dead weak refs when the map grows.
        if locks.len() > 128 {
            locks.retain(|_, weak| weak.strong_count() > 0);
        }

        if let Some(existing) = locks.get(key).and_then(Weak::upgrade) {
            return Ok(existing);
        }

        let lock = Arc::new(Mutex::new(()));
        let _ = locks.insert(key.to_string(), Arc::downgrade(&lock));
        Ok(lock)
    }

    /// Serialize with other writers of the same entity, retrying on busy.
    pub(crate) fn with_entity_write_lock<T>(
        &self,
        key: &str,
        f: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        self.holding_entity_lock(key, || self.retry_on_sqlite_busy(f))
    }

    /// Hold the lock for `key` while `f` runs. No busy retries; `f` takes
    /// its own narrower locks for the writes it makes.
    pub(crate) fn holding_entity_lock<T>(&self, key: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let entity_lock = self.acquire_entity_write_lock(key)?;
        let _guard = entity_lock
            .lock()
            .map_err(|_| EngineError::Internal("entity write lock poisoned".into()))?;
        f()
    }

    /// Serialize with every other balance-affecting writer, retrying on busy.
    pub(crate) fn with_ledger_write_lock<T>(&self, f: impl FnMut() -> Result<T>) -> Result<T> {
        let _guard = self.lock_ledger_write()?;
        self.retry_on_sqlite_busy(f)
    }

    /// Entity lock first, then the ledger lock.
    pub(crate) fn with_entity_and_ledger_lock<T>(
        &self,
        key: &str,
        f: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let entity_lock = self.acquire_entity_write_lock(key)?;
        let _entity = entity_lock
            .lock()
            .map_err(|_| EngineError::Internal("entity write lock poisoned".into()))?;
        let _ledger = self.lock_ledger_write()?;
        self.retry_on_sqlite_busy(f)
    }

    /// Retry an operation on `SQLite` BUSY/LOCKED with linear backoff + jitter.
    ///
    /// Backoff: base = min(attempts * 10, 500) ms, jitter ±25%.
    #[allow(clippy::unused_self)]
    fn retry_on_sqlite_busy<T>(&self, mut f: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempts = 0;

        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(err)
                    if err.is_sqlite_busy_or_locked()
                        && attempts < Self::SQLITE_BUSY_MAX_RETRIES =>
                {
                    attempts += 1;
                    let base_ms = u64::from(attempts).saturating_mul(10).min(500);
                    let jitter_range = base_ms / 4;
                    let jitter = if jitter_range > 0 {
                        rand::random::<u64>() % (jitter_range * 2 + 1)
                    } else {
                        0
                    };
                    let backoff_ms = base_ms.saturating_sub(jitter_range) + jitter;
                    debug!(attempts, backoff_ms, "sqlite busy, retrying write");
                    std::thread::sleep(Duration::from_millis(backoff_ms));
                }
                Err(err) => return Err(err),
            }
        }
    }

    #[cfg(test)]
    fn entity_lock_count(&self) -> usize {
        self.entity_write_locks.lock().map(|l| l.len()).unwrap_or(0)
    }
}

/// Lock key for a case.
pub(crate) fn case_key(id: &str) -> String {
    format!("case:{id}")
}

/// Lock key for everything owned by a study (its artifacts, its case slot).
pub(crate) fn study_key(id: &str) -> String {
    format!("study:{id}")
}

/// Lock key for a stored file. Taken before any other lock by every
/// operation that claims a path for an artifact record.
pub(crate) fn file_key(path: &str) -> String {
    format!("file:{path}")
}

/// Lock key for an upload job.
pub(crate) fn job_key(id: &str) -> String {
    format!("job:{id}")
}

/// Lock key for upload intake (huId allocation).
pub(crate) const INTAKE_KEY: &str = "upload-intake";

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
