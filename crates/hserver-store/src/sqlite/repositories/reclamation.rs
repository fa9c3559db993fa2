//! Reclamation queue for files whose deletion failed after their record
//! was cleared.

use rusqlite::{Connection, Row, params};
use serde::{Deserialize, Serialize};

use hserver_core::ArtifactId;

use crate::errors::Result;
use crate::types::now;

/// Queue of file paths awaiting deletion.
pub struct ReclamationRepo;

/// A file still waiting to be deleted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingReclamation {
    /// Queue row ID.
    pub id: i64,
    /// Storage path.
    pub path: String,
    /// Artifact the file belonged to.
    pub artifact_id: Option<ArtifactId>,
    /// Deletion attempts so far.
    pub attempts: i64,
    /// Most recent failure.
    pub last_error: String,
    /// RFC 3339 time first queued.
    pub created_at: String,
    /// RFC 3339 time of the last attempt.
    pub updated_at: String,
}

impl ReclamationRepo {
    /// Queue a path. A path already queued has its attempt count bumped instead.
    pub fn enqueue(
        conn: &Connection,
        path: &str,
        artifact_id: Option<&ArtifactId>,
        error: &str,
    ) -> Result<()> {
        let ts = now();
        let bumped = conn.execute(
            "UPDATE file_reclamations SET attempts = attempts + 1, last_error = ?2, updated_at = ?3
             WHERE path = ?1",
            params![path, error, ts],
        )?;
        if bumped == 0 {
            let _ = conn.execute(
                "INSERT INTO file_reclamations (path, artifact_id, last_error, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![path, artifact_id.map(ArtifactId::as_str), error, ts],
            )?;
        }
        Ok(())
    }

    /// Pending entries, oldest first.
    pub fn list(conn: &Connection, limit: Option<u32>) -> Result<Vec<PendingReclamation>> {
        let mut stmt = conn.prepare(
            "SELECT id, path, artifact_id, attempts, last_error, created_at, updated_at
             FROM file_reclamations ORDER BY id LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit.map_or(-1, i64::from)], Self::map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Record another failed attempt.
    pub fn record_failure(conn: &Connection, id: i64, error: &str) -> Result<()> {
        let _ = conn.execute(
            "UPDATE file_reclamations SET attempts = attempts + 1, last_error = ?2, updated_at = ?3
             WHERE id = ?1",
            params![id, error, now()],
        )?;
        Ok(())
    }

    /// Drop an entry once its file is gone.
    pub fn remove(conn: &Connection, id: i64) -> Result<bool> {
        let changed = conn.execute("DELETE FROM file_reclamations WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    /// Drop queued entries for a path that is back in use.
    pub fn forget_path(conn: &Connection, path: &str) -> Result<usize> {
        Ok(conn.execute("DELETE FROM file_reclamations WHERE path = ?1", params![path])?)
    }

    /// Entries waiting.
    pub fn count(conn: &Connection) -> Result<i64> {
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM file_reclamations", [], |row| row.get(0))?;
        Ok(count)
    }

    fn map_row(row: &Row<'_>) -> rusqlite::Result<PendingReclamation> {
        Ok(PendingReclamation {
            id: row.get(0)?,
            path: row.get(1)?,
            artifact_id: row.get::<_, Option<String>>(2)?.map(ArtifactId::from_string),
            attempts: row.get(3)?,
            last_error: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }
}
