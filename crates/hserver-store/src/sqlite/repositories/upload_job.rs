//! Upload job repository.

use rusqlite::{Connection, OptionalExtension, Row, params};

use hserver_core::{JobId, StudyId};

use crate::errors::Result;
use crate::types::{RawMetadata, UploadJob, UploadJobStatus, now};

/// Upload job rows. Status changes only apply to IN_PROGRESS jobs.
pub struct UploadJobRepo;

/// Options for inserting a job.
#[derive(Debug, Clone, Copy)]
pub struct NewUploadJob<'a> {
    /// Server code prefix of the huId.
    pub server_code: &'a str,
    /// Numeric suffix of the huId.
    pub hu_index: u64,
    /// Announced metadata.
    pub metadata: &'a RawMetadata,
}

const COLUMNS: &str = "id, hu_id, study_instance_uid, source, instances_count, status, acquired, \
                       message, study_id, created_at, updated_at";

impl UploadJobRepo {
    /// Insert a new IN_PROGRESS job. `acquired` is set when the metadata
    /// carries a `StudyInstanceUID`.
    pub fn insert(conn: &Connection, new: &NewUploadJob<'_>) -> Result<UploadJob> {
        let id = JobId::new();
        let hu_id = format!("{}_{}", new.server_code, new.hu_index);
        let acquired = new.metadata.study_instance_uid.is_some();
        let ts = now();
        let _ = conn.execute(
            "INSERT INTO upload_jobs
               (id, hu_id, server_code, hu_index, study_instance_uid, source, instances_count,
                status, acquired, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
            params![
                id.as_str(),
                hu_id,
                new.server_code,
                i64::try_from(new.hu_index).unwrap_or(i64::MAX),
                new.metadata.study_instance_uid,
                new.metadata.source,
                new.metadata.instances_count,
                UploadJobStatus::InProgress,
                acquired,
                ts,
            ],
        )?;
        Ok(UploadJob {
            id,
            hu_id,
            study_instance_uid: new.metadata.study_instance_uid.clone(),
            source: new.metadata.source.clone(),
            instances_count: new.metadata.instances_count,
            status: UploadJobStatus::InProgress,
            acquired,
            message: None,
            study_id: None,
            created_at: ts.clone(),
            updated_at: ts,
        })
    }

    /// Next free huId index for a server code, never below `start`.
    pub fn next_hu_index(conn: &Connection, server_code: &str, start: u64) -> Result<u64> {
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(hu_index) FROM upload_jobs WHERE server_code = ?1",
            params![server_code],
            |row| row.get(0),
        )?;
        let next = max
            .and_then(|m| u64::try_from(m).ok())
            .map_or(start, |m| m.saturating_add(1));
        Ok(next.max(start))
    }

    /// Get a job by ID.
    pub fn get_by_id(conn: &Connection, id: &str) -> Result<Option<UploadJob>> {
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM upload_jobs WHERE id = ?1"),
                params![id],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Get a job by huId.
    pub fn get_by_hu_id(conn: &Connection, hu_id: &str) -> Result<Option<UploadJob>> {
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM upload_jobs WHERE hu_id = ?1"),
                params![hu_id],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// The IN_PROGRESS job holding a `StudyInstanceUID`, if any.
    pub fn find_active_by_uid(conn: &Connection, study_instance_uid: &str) -> Result<Option<UploadJob>> {
        let row = conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM upload_jobs
                     WHERE study_instance_uid = ?1 AND status = 'IN_PROGRESS'"
                ),
                params![study_instance_uid],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Bind a UID to an IN_PROGRESS job and mark it acquired.
    /// Returns `false` if the job is no longer IN_PROGRESS.
    pub fn set_acquired(conn: &Connection, id: &str, study_instance_uid: &str) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE upload_jobs SET study_instance_uid = ?2, acquired = 1, updated_at = ?3
             WHERE id = ?1 AND status = 'IN_PROGRESS'",
            params![id, study_instance_uid, now()],
        )?;
        Ok(changed > 0)
    }

    /// IN_PROGRESS → DONE. Returns `false` if the job was not IN_PROGRESS.
    pub fn mark_done(conn: &Connection, id: &str, study_id: &StudyId) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE upload_jobs SET status = 'DONE', study_id = ?2, updated_at = ?3
             WHERE id = ?1 AND status = 'IN_PROGRESS'",
            params![id, study_id.as_str(), now()],
        )?;
        Ok(changed > 0)
    }

    /// IN_PROGRESS → REJECT. Returns `false` if the job was not IN_PROGRESS.
    pub fn mark_rejected(conn: &Connection, id: &str, message: &str) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE upload_jobs SET status = 'REJECT', message = ?2, updated_at = ?3
             WHERE id = ?1 AND status = 'IN_PROGRESS'",
            params![id, message, now()],
        )?;
        Ok(changed > 0)
    }

    /// IN_PROGRESS jobs created before `cutoff` (RFC 3339), oldest first.
    pub fn list_stale(conn: &Connection, cutoff: &str) -> Result<Vec<UploadJob>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM upload_jobs
             WHERE status = 'IN_PROGRESS' AND created_at < ?1
             ORDER BY created_at"
        ))?;
        let rows = stmt
            .query_map(params![cutoff], Self::map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Jobs, newest first, optionally in one status.
    pub fn list(conn: &Connection, status: Option<UploadJobStatus>) -> Result<Vec<UploadJob>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM upload_jobs
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY created_at DESC, id DESC"
        ))?;
        let rows = stmt
            .query_map(params![status], Self::map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn map_row(row: &Row<'_>) -> rusqlite::Result<UploadJob> {
        Ok(UploadJob {
            id: JobId::from_string(row.get(0)?),
            hu_id: row.get(1)?,
            study_instance_uid: row.get(2)?,
            source: row.get(3)?,
            instances_count: row.get(4)?,
            status: row.get(5)?,
            acquired: row.get(6)?,
            message: row.get(7)?,
            study_id: row.get::<_, Option<String>>(8)?.map(StudyId::from_string),
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }
}
