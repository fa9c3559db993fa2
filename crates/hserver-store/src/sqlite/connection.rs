//! `r2d2` pool of `SQLite` connections.
//!
//! Every connection the pool hands out has WAL journaling, foreign keys,
//! a busy timeout and `synchronous = NORMAL`. An in-memory pool is one
//! shared-cache database under a fresh name, so all of its connections see
//! the same tables and two pools never see each other's.

use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use uuid::Uuid;

use hserver_settings::DatabaseSettings;

use crate::errors::Result;

/// Pool of `SQLite` connections.
pub type ConnectionPool = Pool<SqliteConnectionManager>;

/// A connection checked out of a [`ConnectionPool`].
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Pool sizing and per-connection pragmas.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Maximum open connections.
    pub pool_size: u32,
    /// How long a writer waits on a locked database, in milliseconds.
    pub busy_timeout_ms: u32,
    /// Page cache per connection, in KiB.
    pub cache_size_kib: i64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from(&DatabaseSettings::default())
    }
}

impl From<&DatabaseSettings> for ConnectionConfig {
    fn from(settings: &DatabaseSettings) -> Self {
        Self {
            pool_size: settings.pool_size,
            busy_timeout_ms: settings.busy_timeout_ms,
            cache_size_kib: settings.cache_size_kib,
        }
    }
}

#[derive(Debug)]
struct ConnectionPragmas {
    busy_timeout_ms: u32,
    cache_size_kib: i64,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for ConnectionPragmas {
    fn on_acquire(&self, conn: &mut Connection) -> rusqlite::Result<()> {
        // journal_mode returns a row, so it cannot go through pragma_update.
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.busy_timeout(Duration::from_millis(u64::from(self.busy_timeout_ms)))?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.pragma_update(None, "cache_size", -self.cache_size_kib)?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(())
    }
}

fn build(manager: SqliteConnectionManager, config: &ConnectionConfig) -> Result<ConnectionPool> {
    Ok(Pool::builder()
        .max_size(config.pool_size)
        .connection_timeout(Duration::from_secs(5))
        .connection_customizer(Box::new(ConnectionPragmas {
            busy_timeout_ms: config.busy_timeout_ms,
            cache_size_kib: config.cache_size_kib,
        }))
        .build(manager)?)
}

/// A private in-memory database, for tests and dry runs.
pub fn new_in_memory(config: &ConnectionConfig) -> Result<ConnectionPool> {
    let uri = format!("file:hserver-{}?mode=memory&cache=shared", Uuid::now_v7());
    build(SqliteConnectionManager::file(uri), config)
}

/// A database file at `path`, created if missing.
pub fn new_file(path: &str, config: &ConnectionConfig) -> Result<ConnectionPool> {
    build(SqliteConnectionManager::file(path), config)
}

/// Pragmas as a connection actually reports them.
#[derive(Debug)]
pub struct PragmaState {
    /// `wal` on disk; `memory` for in-memory databases.
    pub journal_mode: String,
    /// `PRAGMA foreign_keys`.
    pub foreign_keys_enabled: bool,
    /// `PRAGMA busy_timeout`, in milliseconds.
    pub busy_timeout_ms: u32,
}

/// Read back the pragmas the pool applies.
pub fn verify_pragmas(conn: &Connection) -> Result<PragmaState> {
    let read_int = |name: &str| -> rusqlite::Result<i64> {
        conn.pragma_query_value(None, name, |row| row.get(0))
    };
    Ok(PragmaState {
        journal_mode: conn.pragma_query_value(None, "journal_mode", |row| row.get(0))?,
        foreign_keys_enabled: read_int("foreign_keys")? == 1,
        busy_timeout_ms: u32::try_from(read_int("busy_timeout")?).unwrap_or(u32::MAX),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
