//! Embedded schema migrations.
//!
//! Each migration runs in its own transaction together with the
//! `schema_version` row that records it, so a half-applied migration is
//! never recorded and rerunning the runner only applies what is missing.

use rusqlite::{Connection, Transaction, TransactionBehavior, params};
use tracing::{debug, info};

use crate::errors::{EngineError, Result};
use crate::types::now;

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "studies, cases, artifacts, ledger, upload jobs, reclamation queue",
        sql: include_str!("v001_schema.sql"),
    },
    Migration {
        version: 2,
        description: "unique artifact file paths",
        sql: include_str!("v002_artifact_path_unique.sql"),
    },
];

/// Bring the schema up to date. Returns how many migrations were applied.
pub fn run_migrations(conn: &Connection) -> Result<u32> {
    ensure_version_table(conn)?;
    let current = current_version(conn)?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
    if pending.is_empty() {
        debug!(version = current, "schema up to date");
        return Ok(0);
    }
    for migration in &pending {
        info!(version = migration.version, description = migration.description, "applying migration");
        apply(conn, migration)?;
    }
    let applied = u32::try_from(pending.len()).unwrap_or(u32::MAX);
    info!(applied, version = latest_version(), "schema migrated");
    Ok(applied)
}

/// Highest applied version; 0 on a fresh database.
pub fn current_version(conn: &Connection) -> Result<u32> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| row.get(0))
        .map_err(|e| failed(0, "read schema_version", &e))
}

/// Version the code expects.
pub fn latest_version() -> u32 {
    MIGRATIONS.iter().map(|m| m.version).max().unwrap_or(0)
}

fn failed(version: u32, stage: &str, err: &rusqlite::Error) -> EngineError {
    EngineError::Migration {
        message: format!("v{version:03} {stage}: {err}"),
    }
}

fn ensure_version_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
           version     INTEGER PRIMARY KEY,
           description TEXT    NOT NULL,
           applied_at  TEXT    NOT NULL
         );",
    )
    .map_err(|e| failed(0, "create schema_version", &e))
}

fn apply(conn: &Connection, migration: &Migration) -> Result<()> {
    let v = migration.version;
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        .map_err(|e| failed(v, "begin", &e))?;
    tx.execute_batch(migration.sql)
        .map_err(|e| failed(v, migration.description, &e))?;
    let _ = tx
        .execute(
            "INSERT INTO schema_version (version, description, applied_at) VALUES (?1, ?2, ?3)",
            params![v, migration.description, now()],
        )
        .map_err(|e| failed(v, "record", &e))?;
    tx.commit().map_err(|e| failed(v, "commit", &e))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
