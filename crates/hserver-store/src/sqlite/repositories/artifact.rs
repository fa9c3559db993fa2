//! Artifact repository.
//!
//! Every mutation is conditional on the `revision` the caller read and bumps
//! it by one, so a writer holding a stale view updates nothing.

use rusqlite::{Connection, OptionalExtension, Row, params};

use hserver_core::{ArtifactId, StudyId};

use crate::errors::Result;
use crate::types::{ArtifactKind, ArtifactRecord, bytes_from_sql, bytes_to_sql, now};

/// Artifact records keyed by `(study_id, kind)`.
pub struct ArtifactRepo;

/// Bytes held by present files, split by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageTotals {
    /// Raw input files.
    pub raw: u64,
    /// Result files.
    pub result: u64,
}

const COLUMNS: &str =
    "id, study_id, kind, file_path, file_size, version, revision, created_at, updated_at";

impl ArtifactRepo {
    /// Insert an empty record for `(study, kind)`.
    pub fn create(conn: &Connection, study_id: &StudyId, kind: ArtifactKind) -> Result<ArtifactRecord> {
        let id = ArtifactId::new();
        let ts = now();
        let _ = conn.execute(
            "INSERT INTO artifacts (id, study_id, kind, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![id.as_str(), study_id.as_str(), kind, ts],
        )?;
        Ok(ArtifactRecord {
            id,
            study_id: study_id.clone(),
            kind,
            file_path: None,
            file_size: 0,
            version: None,
            revision: 0,
            created_at: ts.clone(),
            updated_at: ts,
        })
    }

    /// Get an artifact by ID.
    pub fn get_by_id(conn: &Connection, id: &str) -> Result<Option<ArtifactRecord>> {
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM artifacts WHERE id = ?1"),
                params![id],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Get the record of one kind for a study.
    pub fn get_for_study(
        conn: &Connection,
        study_id: &str,
        kind: ArtifactKind,
    ) -> Result<Option<ArtifactRecord>> {
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM artifacts WHERE study_id = ?1 AND kind = ?2"),
                params![study_id, kind],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// All records for a study, RAW first.
    pub fn list_for_study(conn: &Connection, study_id: &str) -> Result<Vec<ArtifactRecord>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM artifacts WHERE study_id = ?1 ORDER BY kind"
        ))?;
        let rows = stmt
            .query_map(params![study_id], Self::map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// The record whose present file is stored at `path`.
    pub fn find_by_path(conn: &Connection, path: &str) -> Result<Option<ArtifactRecord>> {
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM artifacts WHERE file_path = ?1"),
                params![path],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Set the file of a record whose revision is still `expected_revision`.
    ///
    /// Returns `false` if the revision moved.
    pub fn fill(
        conn: &Connection,
        id: &str,
        expected_revision: i64,
        path: &str,
        size: u64,
        version: Option<u32>,
    ) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE artifacts
             SET file_path = ?3, file_size = ?4, version = ?5,
                 revision = revision + 1, updated_at = ?6
             WHERE id = ?1 AND revision = ?2",
            params![id, expected_revision, path, bytes_to_sql(size), version, now()],
        )?;
        Ok(changed > 0)
    }

    /// Empty a record whose revision is still `expected_revision`.
    ///
    /// Returns `false` if the revision moved.
    pub fn clear(conn: &Connection, id: &str, expected_revision: i64) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE artifacts
             SET file_path = NULL, file_size = 0, version = NULL,
                 revision = revision + 1, updated_at = ?3
             WHERE id = ?1 AND revision = ?2",
            params![id, expected_revision, now()],
        )?;
        Ok(changed > 0)
    }

    /// Sum of sizes of present files, by kind.
    pub fn usage(conn: &Connection) -> Result<UsageTotals> {
        let mut stmt = conn.prepare(
            "SELECT kind, COALESCE(SUM(file_size), 0) FROM artifacts
             WHERE file_path IS NOT NULL GROUP BY kind",
        )?;
        let mut totals = UsageTotals::default();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, ArtifactKind>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (kind, bytes) = row?;
            match kind {
                ArtifactKind::Raw => totals.raw = bytes_from_sql(bytes),
                ArtifactKind::Result => totals.result = bytes_from_sql(bytes),
            }
        }
        Ok(totals)
    }

    fn map_row(row: &Row<'_>) -> rusqlite::Result<ArtifactRecord> {
        Ok(ArtifactRecord {
            id: ArtifactId::from_string(row.get(0)?),
            study_id: StudyId::from_string(row.get(1)?),
            kind: row.get(2)?,
            file_path: row.get(3)?,
            file_size: bytes_from_sql(row.get(4)?),
            version: row.get(5)?,
            revision: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }
}
