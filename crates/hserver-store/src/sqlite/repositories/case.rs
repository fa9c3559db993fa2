//! Case repository.
//!
//! Status writes are conditional on the status the caller observed, so two
//! writers racing on one case cannot both succeed.

use rusqlite::{Connection, OptionalExtension, Row, params};

use hserver_core::{ActorId, CaseId, StudyId};

use crate::errors::Result;
use crate::types::{CaseStatus, RusCase, now};

/// Queries and conditional updates on `rus_cases`.
pub struct CaseRepo;

/// Options for listing cases.
#[derive(Debug, Clone, Default)]
pub struct ListCasesOptions<'a> {
    /// Only cases owned by this actor.
    pub owner: Option<&'a ActorId>,
    /// Only cases in this status.
    pub status: Option<CaseStatus>,
    /// Include soft-deleted cases.
    pub include_deleted: bool,
    /// Page size.
    pub limit: Option<u32>,
    /// Rows to skip.
    pub offset: u32,
}

const COLUMNS: &str = "id, study_id, owner_id, status, created_at, updated_at, deleted_at";

impl CaseRepo {
    /// Insert a new IN_PROGRESS case.
    pub fn insert(conn: &Connection, id: &CaseId, study_id: &StudyId, owner: &ActorId) -> Result<RusCase> {
        let ts = now();
        let _ = conn.execute(
            "INSERT INTO rus_cases (id, study_id, owner_id, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                id.as_str(),
                study_id.as_str(),
                owner.as_str(),
                CaseStatus::InProgress,
                ts
            ],
        )?;
        Ok(RusCase {
            id: id.clone(),
            study_id: study_id.clone(),
            owner: owner.clone(),
            status: CaseStatus::InProgress,
            created_at: ts.clone(),
            updated_at: ts,
            deleted_at: None,
        })
    }

    /// Get a case by ID, including soft-deleted ones.
    pub fn get_by_id(conn: &Connection, id: &str) -> Result<Option<RusCase>> {
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM rus_cases WHERE id = ?1"),
                params![id],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Get the case created against a study.
    pub fn get_by_study(conn: &Connection, study_id: &str) -> Result<Option<RusCase>> {
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM rus_cases WHERE study_id = ?1"),
                params![study_id],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Move a live case from `from` to `to`. Returns `false` if the stored
    /// status was not `from` (or the case is deleted).
    pub fn update_status(conn: &Connection, id: &str, from: CaseStatus, to: CaseStatus) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE rus_cases SET status = ?3, updated_at = ?4
             WHERE id = ?1 AND status = ?2 AND deleted_at IS NULL",
            params![id, from, to, now()],
        )?;
        Ok(changed > 0)
    }

    /// Soft-delete a case. Returns `false` if it was already deleted.
    pub fn mark_deleted(conn: &Connection, id: &str) -> Result<bool> {
        let ts = now();
        let changed = conn.execute(
            "UPDATE rus_cases SET deleted_at = ?2, updated_at = ?2
             WHERE id = ?1 AND deleted_at IS NULL",
            params![id, ts],
        )?;
        Ok(changed > 0)
    }

    /// List cases, newest first.
    pub fn list(conn: &Connection, opts: &ListCasesOptions<'_>) -> Result<Vec<RusCase>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM rus_cases
             WHERE (?1 IS NULL OR owner_id = ?1)
               AND (?2 IS NULL OR status = ?2)
               AND (?3 = 1 OR deleted_at IS NULL)
             ORDER BY created_at DESC, id DESC
             LIMIT ?4 OFFSET ?5"
        ))?;
        let rows = stmt
            .query_map(
                params![
                    opts.owner.map(ActorId::as_str),
                    opts.status,
                    opts.include_deleted,
                    opts.limit.map_or(-1, i64::from),
                    opts.offset,
                ],
                Self::map_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn map_row(row: &Row<'_>) -> rusqlite::Result<RusCase> {
        Ok(RusCase {
            id: CaseId::from_string(row.get(0)?),
            study_id: StudyId::from_string(row.get(1)?),
            owner: ActorId::from_string(row.get(2)?),
            status: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
            deleted_at: row.get(6)?,
        })
    }
}
