//! Study repository.

use rusqlite::{Connection, OptionalExtension, Row, params};

use hserver_core::{JobId, StudyId};

use crate::errors::Result;
use crate::types::{Study, now};

/// Materialized studies.
pub struct StudyRepo;

const COLUMNS: &str = "id, hu_id, study_instance_uid, upload_job_id, created_at";

impl StudyRepo {
    /// Insert a study.
    pub fn insert(
        conn: &Connection,
        hu_id: &str,
        study_instance_uid: Option<&str>,
        upload_job_id: Option<&JobId>,
    ) -> Result<Study> {
        let study = Study {
            id: StudyId::new(),
            hu_id: hu_id.to_string(),
            study_instance_uid: study_instance_uid.map(str::to_string),
            upload_job_id: upload_job_id.cloned(),
            created_at: now(),
        };
        let _ = conn.execute(
            "INSERT INTO studies (id, hu_id, study_instance_uid, upload_job_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                study.id.as_str(),
                study.hu_id,
                study.study_instance_uid,
                study.upload_job_id.as_ref().map(JobId::as_str),
                study.created_at,
            ],
        )?;
        Ok(study)
    }

    /// Get a study by ID.
    pub fn get_by_id(conn: &Connection, id: &str) -> Result<Option<Study>> {
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM studies WHERE id = ?1"),
                params![id],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Get a study by its `StudyInstanceUID`.
    pub fn get_by_uid(conn: &Connection, study_instance_uid: &str) -> Result<Option<Study>> {
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM studies WHERE study_instance_uid = ?1"),
                params![study_instance_uid],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Get a study by huId.
    pub fn get_by_hu_id(conn: &Connection, hu_id: &str) -> Result<Option<Study>> {
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM studies WHERE hu_id = ?1"),
                params![hu_id],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    fn map_row(row: &Row<'_>) -> rusqlite::Result<Study> {
        Ok(Study {
            id: StudyId::from_string(row.get(0)?),
            hu_id: row.get(1)?,
            study_instance_uid: row.get(2)?,
            upload_job_id: row.get::<_, Option<String>>(3)?.map(JobId::from_string),
            created_at: row.get(4)?,
        })
    }
}
