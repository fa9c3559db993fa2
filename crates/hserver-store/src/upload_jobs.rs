//! Upload Job Tracker: raw study intake from first bytes to a materialized
//! [`Study`].
//!
//! A job is IN_PROGRESS until it either produces a study (DONE) or is
//! rejected (REJECT). Terminal jobs never change again; repeating the same
//! terminal transition is a no-op.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use tracing::{debug, info, instrument};

use hserver_core::{DomainEvent, JobId, StudyId};
use hserver_settings::UploadSettings;

use crate::artifacts;
use crate::errors::{EngineError, Result};
use crate::sqlite::repositories::study::StudyRepo;
use crate::sqlite::repositories::upload_job::{NewUploadJob, UploadJobRepo};
use crate::store::{INTAKE_KEY, Store, file_key, job_key};
use crate::types::{ArtifactKind, FileRef, RawMetadata, Study, UploadJob, UploadJobStatus};

/// Message recorded on jobs expired by [`UploadJobTracker::expire_stale`].
pub const TIMED_OUT: &str = "timed out";

/// Outcome of [`UploadJobTracker::create`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateJobResult {
    /// The new job, or the IN_PROGRESS job already holding the UID.
    pub job: UploadJob,
    /// `true` if this call bound a new huId.
    pub affected: bool,
}

/// Tracks upload jobs and turns them into studies.
#[derive(Clone)]
pub struct UploadJobTracker {
    store: Arc<Store>,
    settings: UploadSettings,
}

impl UploadJobTracker {
    /// Create a tracker over `store`.
    pub fn new(store: Arc<Store>, settings: UploadSettings) -> Self {
        Self { store, settings }
    }

    /// Register incoming raw data and assign a huId.
    ///
    /// While a job for the same non-null `StudyInstanceUID` is IN_PROGRESS
    /// this returns that job with `affected = false` instead of allocating a
    /// new huId. Stale jobs for the UID are expired first.
    #[instrument(skip(self))]
    pub fn create(&self, metadata: &RawMetadata) -> Result<CreateJobResult> {
        let cutoff = self.cutoff(Utc::now());
        let (result, events) = self.store.with_entity_write_lock(INTAKE_KEY, || {
            self.store.write(|tx| {
                let mut events = Vec::new();
                if let Some(uid) = metadata.study_instance_uid.as_deref() {
                    if let Some(active) = UploadJobRepo::find_active_by_uid(tx, uid)? {
                        if active.created_at.as_str() < cutoff.as_str() {
                            events.push(reject_in(tx, &active, TIMED_OUT)?);
                        } else {
                            debug!(job_id = %active.id, hu_id = %active.hu_id, "reusing active job");
                            return Ok((
                                CreateJobResult {
                                    job: active,
                                    affected: false,
                                },
                                events,
                            ));
                        }
                    }
                    if let Some(study) = StudyRepo::get_by_uid(tx, uid)? {
                        return Err(EngineError::DuplicateStudyInstanceUid {
                            study_instance_uid: uid.to_string(),
                            holder: study.id.to_string(),
                        });
                    }
                }

                let index = UploadJobRepo::next_hu_index(
                    tx,
                    &self.settings.server_code,
                    self.settings.hu_id_start_index,
                )?;
                let job = UploadJobRepo::insert(
                    tx,
                    &NewUploadJob {
                        server_code: &self.settings.server_code,
                        hu_index: index,
                        metadata,
                    },
                )?;
                events.push(DomainEvent::UploadJobCreated {
                    job_id: job.id.clone(),
                    hu_id: job.hu_id.clone(),
                });
                Ok((CreateJobResult { job, affected: true }, events))
            })
        })?;
        if result.affected {
            debug!(job_id = %result.job.id, hu_id = %result.job.hu_id, "upload job created");
        }
        self.store.publish(&events);
        Ok(result)
    }

    /// Bind a `StudyInstanceUID` to a job created without one.
    #[instrument(skip(self))]
    pub fn acquire(&self, job_id: &JobId, study_instance_uid: &str) -> Result<UploadJob> {
        if study_instance_uid.trim().is_empty() {
            return Err(EngineError::InvalidArgument("studyInstanceUID is empty".into()));
        }
        self.store.with_entity_write_lock(INTAKE_KEY, || {
            self.store.write(|tx| {
                let job = load(tx, job_id)?;
                require_in_progress(&job, UploadJobStatus::InProgress)?;
                let bound = job.study_instance_uid.clone();
                match bound.as_deref() {
                    Some(uid) if uid == study_instance_uid && job.acquired => return Ok(job),
                    Some(uid) if uid != study_instance_uid => {
                        return Err(EngineError::InvalidArgument(format!(
                            "job {} already bound to studyInstanceUID {uid}",
                            job.id
                        )));
                    }
                    _ => {}
                }
                if let Some(other) = UploadJobRepo::find_active_by_uid(tx, study_instance_uid)? {
                    if other.id != job.id {
                        return Err(EngineError::DuplicateStudyInstanceUid {
                            study_instance_uid: study_instance_uid.to_string(),
                            holder: other.id.to_string(),
                        });
                    }
                }
                if let Some(study) = StudyRepo::get_by_uid(tx, study_instance_uid)? {
                    return Err(EngineError::DuplicateStudyInstanceUid {
                        study_instance_uid: study_instance_uid.to_string(),
                        holder: study.id.to_string(),
                    });
                }
                let _ = UploadJobRepo::set_acquired(tx, job_id, study_instance_uid)?;
                load(tx, job_id)
            })
        })
    }

    /// IN_PROGRESS → DONE, fixing the study reference.
    #[instrument(skip(self))]
    pub fn mark_materialized(&self, job_id: &JobId, study_id: &StudyId) -> Result<UploadJob> {
        let (job, event) = self.store.with_entity_write_lock(&job_key(job_id), || {
            self.store.write(|tx| {
                let job = load(tx, job_id)?;
                if job.status == UploadJobStatus::Done && job.study_id.as_ref() == Some(study_id) {
                    return Ok((job, None));
                }
                require_in_progress(&job, UploadJobStatus::Done)?;
                if StudyRepo::get_by_id(tx, study_id)?.is_none() {
                    return Err(EngineError::StudyNotFound(study_id.to_string()));
                }
                let event = done_in(tx, &job, study_id)?;
                Ok((load(tx, job_id)?, Some(event)))
            })
        })?;
        self.store.publish(event.as_slice());
        Ok(job)
    }

    /// IN_PROGRESS → REJECT with a reason.
    #[instrument(skip(self))]
    pub fn mark_rejected(&self, job_id: &JobId, message: &str) -> Result<UploadJob> {
        let (job, event) = self.store.with_entity_write_lock(&job_key(job_id), || {
            self.store.write(|tx| {
                let job = load(tx, job_id)?;
                if job.status == UploadJobStatus::Reject && job.message.as_deref() == Some(message) {
                    return Ok((job, None));
                }
                require_in_progress(&job, UploadJobStatus::Reject)?;
                let event = reject_in(tx, &job, message)?;
                Ok((load(tx, job_id)?, Some(event)))
            })
        })?;
        self.store.publish(event.as_slice());
        Ok(job)
    }

    /// Create the study for a finished upload, attach its RAW file, and mark
    /// the job DONE, all in one transaction. Repeating it on a DONE job
    /// returns the existing study.
    #[instrument(skip(self))]
    pub fn materialize(&self, job_id: &JobId, raw_file: &FileRef) -> Result<Study> {
        let (study, events) = self.store.holding_entity_lock(&file_key(&raw_file.path), || {
            self.store.with_entity_write_lock(&job_key(job_id), || {
                self.store.write(|tx| materialize_in(tx, job_id, raw_file))
            })
        })?;
        self.store.publish(&events);
        Ok(study)
    }

    /// Reject IN_PROGRESS jobs older than the configured timeout.
    #[instrument(skip(self))]
    pub fn expire_stale(&self, now: DateTime<Utc>) -> Result<Vec<UploadJob>> {
        let cutoff = self.cutoff(now);
        let (expired, events) = self.store.with_entity_write_lock(INTAKE_KEY, || {
            self.store.write(|tx| {
                let mut expired = Vec::new();
                let mut events = Vec::new();
                for job in UploadJobRepo::list_stale(tx, &cutoff)? {
                    events.push(reject_in(tx, &job, TIMED_OUT)?);
                    expired.push(load(tx, &job.id)?);
                }
                Ok((expired, events))
            })
        })?;
        if !expired.is_empty() {
            info!(count = expired.len(), "expired stale upload jobs");
        }
        self.store.publish(&events);
        Ok(expired)
    }

    /// Get a job by ID.
    pub fn get(&self, job_id: &JobId) -> Result<UploadJob> {
        self.store.read(|conn| load(conn, job_id))
    }

    /// Get a job by huId.
    pub fn find_by_hu_id(&self, hu_id: &str) -> Result<Option<UploadJob>> {
        self.store.read(|conn| UploadJobRepo::get_by_hu_id(conn, hu_id))
    }

    /// Get a materialized study.
    pub fn study(&self, study_id: &StudyId) -> Result<Study> {
        self.store.read(|conn| {
            StudyRepo::get_by_id(conn, study_id)?
                .ok_or_else(|| EngineError::StudyNotFound(study_id.to_string()))
        })
    }

    /// Jobs, newest first.
    pub fn list(&self, status: Option<UploadJobStatus>) -> Result<Vec<UploadJob>> {
        self.store.read(|conn| UploadJobRepo::list(conn, status))
    }

    fn cutoff(&self, now: DateTime<Utc>) -> String {
        let timeout = i64::try_from(self.settings.job_timeout_ms).unwrap_or(i64::MAX);
        now.checked_sub_signed(Duration::milliseconds(timeout))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
            .to_rfc3339()
    }
}

fn materialize_in(conn: &Connection, job_id: &JobId, raw_file: &FileRef) -> Result<(Study, Vec<DomainEvent>)> {
    let job = load(conn, job_id)?;
    if let (UploadJobStatus::Done, Some(study_id)) = (job.status, job.study_id.as_ref()) {
        if let Some(study) = StudyRepo::get_by_id(conn, study_id)? {
            return Ok((study, Vec::new()));
        }
    }
    require_in_progress(&job, UploadJobStatus::Done)?;
    if let Some(uid) = job.study_instance_uid.as_deref() {
        if let Some(existing) = StudyRepo::get_by_uid(conn, uid)? {
            return Err(EngineError::DuplicateStudyInstanceUid {
                study_instance_uid: uid.to_string(),
                holder: existing.id.to_string(),
            });
        }
    }

    let study = StudyRepo::insert(conn, &job.hu_id, job.study_instance_uid.as_deref(), Some(&job.id))?;
    let attached = artifacts::attach_in(conn, &study.id, ArtifactKind::Raw, raw_file)?;
    let done = done_in(conn, &job, &study.id)?;
    Ok((study, vec![attached.event, done]))
}

fn load(conn: &Connection, job_id: &JobId) -> Result<UploadJob> {
    UploadJobRepo::get_by_id(conn, job_id)?.ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))
}

fn require_in_progress(job: &UploadJob, target: UploadJobStatus) -> Result<()> {
    if job.status == UploadJobStatus::InProgress {
        return Ok(());
    }
    Err(EngineError::InvalidStateTransition {
        entity: "upload job",
        id: job.id.to_string(),
        from: job.status.to_string(),
        to: target.to_string(),
    })
}

fn done_in(conn: &Connection, job: &UploadJob, study_id: &StudyId) -> Result<DomainEvent> {
    if !UploadJobRepo::mark_done(conn, &job.id, study_id)? {
        return Err(EngineError::Internal(format!("upload job {} changed mid-transaction", job.id)));
    }
    debug!(job_id = %job.id, study_id = %study_id, "upload job materialized");
    Ok(DomainEvent::UploadJobMaterialized {
        job_id: job.id.clone(),
        study_id: study_id.clone(),
    })
}

fn reject_in(conn: &Connection, job: &UploadJob, message: &str) -> Result<DomainEvent> {
    if !UploadJobRepo::mark_rejected(conn, &job.id, message)? {
        return Err(EngineError::Internal(format!("upload job {} changed mid-transaction", job.id)));
    }
    debug!(job_id = %job.id, message, "upload job rejected");
    Ok(DomainEvent::UploadJobRejected {
        job_id: job.id.clone(),
        message: message.to_string(),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
