//! Artifact Version Manager: the raw input and generated result files of a
//! study.
//!
//! Records are updated first and files released after commit, so a crash
//! leaves at most an orphaned file, never a record pointing at a missing one.
//! A release that fails is queued in `file_reclamations` and reported to the
//! caller; the logical operation still stands.

use std::sync::Arc;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use hserver_core::{ArtifactId, CaseId, DomainEvent, ErrorKind, StudyId};

use crate::errors::{EngineError, Result};
use crate::files::FileStorage;
use crate::sqlite::repositories::artifact::ArtifactRepo;
use crate::sqlite::repositories::case::CaseRepo;
use crate::sqlite::repositories::reclamation::{PendingReclamation, ReclamationRepo};
use crate::sqlite::repositories::study::StudyRepo;
use crate::store::{Store, file_key, study_key};
use crate::types::{ArtifactKind, ArtifactRecord, FileRef};

/// A file that could not be deleted after its record was updated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReclaimFailure {
    /// Storage path left behind.
    pub path: String,
    /// Artifact the file belonged to.
    pub artifact_id: Option<ArtifactId>,
    /// Underlying failure.
    pub reason: String,
}

impl ReclaimFailure {
    /// Always `STORAGE_DELETE_FAILED`.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::StorageDeleteFailed
    }

    /// As an error value, for callers that want to surface it.
    #[must_use]
    pub fn to_error(&self) -> EngineError {
        EngineError::StorageDeleteFailed {
            path: self.path.clone(),
            reason: self.reason.clone(),
        }
    }
}

/// Outcome of an attach, replace, or ingest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactChange {
    /// Record after the change; `version` is the new result version.
    pub artifact: ArtifactRecord,
    /// Set if the superseded file could not be deleted.
    pub reclaim: Option<ReclaimFailure>,
}

/// Outcome of a delete.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteReport {
    /// Record after the delete.
    pub artifact: ArtifactRecord,
    /// Bytes no longer counted as used (0 if nothing was present).
    pub freed_bytes: u64,
    /// Set if the file could not be deleted.
    pub reclaim: Option<ReclaimFailure>,
}

/// Outcome of a reclamation pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReclamationSummary {
    /// Entries attempted.
    pub attempted: usize,
    /// Entries whose file is now gone.
    pub reclaimed: usize,
    /// Entries still queued.
    pub remaining: i64,
}

/// A file whose record no longer references it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Released {
    pub(crate) path: String,
    pub(crate) artifact_id: ArtifactId,
}

/// A record change made inside a caller's transaction.
#[derive(Clone, Debug)]
pub(crate) struct Applied {
    pub(crate) record: ArtifactRecord,
    pub(crate) released: Option<Released>,
    pub(crate) event: DomainEvent,
}

/// Owns every artifact record mutation and every file-storage call.
#[derive(Clone)]
pub struct ArtifactManager {
    store: Arc<Store>,
    files: Arc<dyn FileStorage>,
}

impl ArtifactManager {
    /// Create a manager over `store` releasing files through `files`.
    pub fn new(store: Arc<Store>, files: Arc<dyn FileStorage>) -> Self {
        Self { store, files }
    }

    /// Attach a file to the empty `(study, kind)` record, creating the record
    /// if needed. A result artifact starts at version 1.
    ///
    /// Fails with `CONFLICT` if a file is already present, or if the path is
    /// the present file of another record.
    #[instrument(skip(self))]
    pub fn attach(&self, study_id: &StudyId, kind: ArtifactKind, file: &FileRef) -> Result<ArtifactRecord> {
        let applied = self.store.holding_entity_lock(&file_key(&file.path), || {
            self.store.with_entity_write_lock(&study_key(study_id), || {
                self.store.write(|tx| attach_in(tx, study_id, kind, file))
            })
        })?;
        self.store.publish(&[applied.event]);
        Ok(applied.record)
    }

    /// [`attach`](Self::attach) addressed by the owning case. Fails with
    /// `NOT_FOUND_CASE` for an unknown or deleted case.
    pub fn attach_for_case(&self, case_id: &CaseId, kind: ArtifactKind, file: &FileRef) -> Result<ArtifactRecord> {
        let study_id = self
            .store
            .read(|conn| CaseRepo::get_by_id(conn, case_id))?
            .filter(|c| c.deleted_at.is_none())
            .ok_or_else(|| EngineError::CaseNotFound(case_id.to_string()))?
            .study_id;
        self.attach(&study_id, kind, file)
    }

    /// Swap the present file for a new one. A result artifact's version goes
    /// up by exactly one.
    ///
    /// With `expected_revision`, fails with `CONFLICT` unless the record is
    /// still at that revision. Without it, the replace applies on top of
    /// whatever revision is current. Fails with `CONFLICT` if the new path is
    /// the present file of another record.
    #[instrument(skip(self))]
    pub fn replace(
        &self,
        id: &ArtifactId,
        file: &FileRef,
        expected_revision: Option<i64>,
    ) -> Result<ArtifactChange> {
        let current = self.get(id)?;
        let applied = self.store.holding_entity_lock(&file_key(&file.path), || {
            self.store.with_entity_write_lock(&study_key(&current.study_id), || {
                self.store.write(|tx| {
                    let record = load(tx, id)?;
                    replace_in(tx, &record, file, expected_revision)
                })
            })
        })?;
        let reclaim = self.release(applied.released.as_slice()).into_iter().next();
        self.store.publish(&[applied.event]);
        Ok(ArtifactChange {
            artifact: applied.record,
            reclaim,
        })
    }

    /// Empty the record and release its file. Deleting an empty record is a
    /// no-op.
    #[instrument(skip(self))]
    pub fn delete(&self, id: &ArtifactId) -> Result<DeleteReport> {
        let current = self.get(id)?;
        let (record, cleared) = self.store.with_entity_write_lock(&study_key(&current.study_id), || {
            self.store.write(|tx| {
                let record = load(tx, id)?;
                let cleared = clear_in(tx, &record)?;
                let after = load(tx, id)?;
                Ok((after, cleared))
            })
        })?;

        let Some(cleared) = cleared else {
            debug!(artifact_id = %id, "artifact already empty");
            return Ok(DeleteReport {
                artifact: record,
                freed_bytes: 0,
                reclaim: None,
            });
        };
        let reclaim = self.release(std::slice::from_ref(&cleared.released)).into_iter().next();
        self.store.publish(&[cleared.event]);
        Ok(DeleteReport {
            artifact: record,
            freed_bytes: cleared.freed_bytes,
            reclaim,
        })
    }

    /// Write `bytes` to `path`, then attach or replace the `(study, kind)`
    /// record. If the record update fails the new file is removed again.
    ///
    /// Fails with `CONFLICT` before anything is written if `path` is the
    /// present file of another record.
    #[instrument(skip(self, bytes), fields(len = bytes.len()))]
    pub fn ingest(
        &self,
        study_id: &StudyId,
        kind: ArtifactKind,
        path: &str,
        bytes: &[u8],
    ) -> Result<ArtifactChange> {
        if bytes.is_empty() {
            return Err(EngineError::InvalidArgument("artifact file is empty".into()));
        }
        self.store
            .holding_entity_lock(&file_key(path), || self.ingest_claimed(study_id, kind, path, bytes))
    }

    /// Body of [`ingest`](Self::ingest). Runs while `path` is locked, so no
    /// other record can claim it between the check and the commit.
    fn ingest_claimed(
        &self,
        study_id: &StudyId,
        kind: ArtifactKind,
        path: &str,
        bytes: &[u8],
    ) -> Result<ArtifactChange> {
        let current = self.get_for_study(study_id, kind)?;
        let owner = current.as_ref().map(|r| r.id.clone());
        let previous_path = current.and_then(|r| r.file_path);
        self.store
            .read(|conn| ensure_path_free(conn, path, owner.as_ref()))?;

        let size = self.files.write_file(path, bytes)?;
        let file = FileRef::new(path, size);
        let result = self.store.with_entity_write_lock(&study_key(study_id), || {
            self.store.write(|tx| upsert_in(tx, study_id, kind, &file))
        });
        let applied = match result {
            Ok(applied) => applied,
            Err(err) => {
                if previous_path.as_deref() != Some(path) {
                    if let Err(e) = self.files.delete_file(path) {
                        warn!(path, error = %e, "failed to remove file after rejected ingest");
                    }
                }
                return Err(err);
            }
        };

        let reclaim = self.release(applied.released.as_slice()).into_iter().next();
        self.store.publish(&[applied.event]);
        Ok(ArtifactChange {
            artifact: applied.record,
            reclaim,
        })
    }

    /// Get an artifact by ID.
    pub fn get(&self, id: &ArtifactId) -> Result<ArtifactRecord> {
        self.store.read(|conn| load(conn, id))
    }

    /// The `(study, kind)` record, if one was ever created.
    pub fn get_for_study(&self, study_id: &StudyId, kind: ArtifactKind) -> Result<Option<ArtifactRecord>> {
        self.store
            .read(|conn| ArtifactRepo::get_for_study(conn, study_id, kind))
    }

    /// All records of a study.
    pub fn list_for_study(&self, study_id: &StudyId) -> Result<Vec<ArtifactRecord>> {
        self.store.read(|conn| ArtifactRepo::list_for_study(conn, study_id))
    }

    /// Files still waiting for deletion.
    pub fn pending_reclamations(&self) -> Result<Vec<PendingReclamation>> {
        self.store.read(|conn| ReclamationRepo::list(conn, None))
    }

    /// Retry queued deletions. A file that is already gone counts as reclaimed.
    #[instrument(skip(self))]
    pub fn retry_reclamations(&self, limit: Option<u32>) -> Result<ReclamationSummary> {
        let conn = self.store.conn()?;
        let pending = ReclamationRepo::list(&conn, limit)?;
        let mut summary = ReclamationSummary {
            attempted: pending.len(),
            ..ReclamationSummary::default()
        };
        for entry in pending {
            match self.files.delete_file(&entry.path) {
                Ok(outcome) => {
                    debug!(path = %entry.path, ?outcome, "reclaimed file");
                    let _ = ReclamationRepo::remove(&conn, entry.id)?;
                    summary.reclaimed += 1;
                }
                Err(e) => {
                    warn!(path = %entry.path, attempts = entry.attempts + 1, error = %e, "reclamation failed");
                    ReclamationRepo::record_failure(&conn, entry.id, &e.to_string())?;
                }
            }
        }
        summary.remaining = ReclamationRepo::count(&conn)?;
        Ok(summary)
    }

    /// Delete released files. Failures are queued and returned, never raised.
    pub(crate) fn release(&self, released: &[Released]) -> Vec<ReclaimFailure> {
        let mut failures = Vec::new();
        for r in released {
            match self.files.delete_file(&r.path) {
                Ok(outcome) => debug!(path = %r.path, ?outcome, "released file"),
                Err(e) => {
                    warn!(path = %r.path, artifact_id = %r.artifact_id, error = %e, "file delete failed, queued for reclamation");
                    let reason = e.to_string();
                    let queued = self.store.conn().and_then(|conn| {
                        ReclamationRepo::enqueue(&conn, &r.path, Some(&r.artifact_id), &reason)
                    });
                    if let Err(qe) = queued {
                        warn!(path = %r.path, error = %qe, "could not queue reclamation");
                    }
                    failures.push(ReclaimFailure {
                        path: r.path.clone(),
                        artifact_id: Some(r.artifact_id.clone()),
                        reason,
                    });
                }
            }
        }
        failures
    }
}

/// A cleared record's released file and event.
#[derive(Clone, Debug)]
pub(crate) struct Cleared {
    pub(crate) released: Released,
    pub(crate) freed_bytes: u64,
    pub(crate) event: DomainEvent,
}

fn load(conn: &Connection, id: &ArtifactId) -> Result<ArtifactRecord> {
    ArtifactRepo::get_by_id(conn, id)?.ok_or_else(|| EngineError::ArtifactNotFound(id.to_string()))
}

fn validate_file(file: &FileRef) -> Result<()> {
    if file.path.trim().is_empty() {
        return Err(EngineError::InvalidArgument("artifact path is empty".into()));
    }
    if file.size == 0 {
        return Err(EngineError::InvalidArgument(format!(
            "artifact file {} has size 0",
            file.path
        )));
    }
    Ok(())
}

/// `CONFLICT` if `path` is the present file of a record other than `owner`.
fn ensure_path_free(conn: &Connection, path: &str, owner: Option<&ArtifactId>) -> Result<()> {
    match ArtifactRepo::find_by_path(conn, path)? {
        Some(holder) if owner != Some(&holder.id) => Err(EngineError::Conflict {
            entity: "artifact",
            id: holder.id.to_string(),
            revision: holder.revision,
            reason: format!("file {path} belongs to another artifact"),
        }),
        _ => Ok(()),
    }
}

fn revision_moved(record: &ArtifactRecord) -> EngineError {
    EngineError::Conflict {
        entity: "artifact",
        id: record.id.to_string(),
        revision: record.revision,
        reason: "record changed concurrently".into(),
    }
}

/// Attach inside the caller's transaction.
pub(crate) fn attach_in(
    conn: &Connection,
    study_id: &StudyId,
    kind: ArtifactKind,
    file: &FileRef,
) -> Result<Applied> {
    validate_file(file)?;
    if StudyRepo::get_by_id(conn, study_id)?.is_none() {
        return Err(EngineError::StudyNotFound(study_id.to_string()));
    }
    let record = match ArtifactRepo::get_for_study(conn, study_id, kind)? {
        Some(record) => record,
        None => ArtifactRepo::create(conn, study_id, kind)?,
    };
    if record.has_file() {
        return Err(EngineError::Conflict {
            entity: "artifact",
            id: record.id.to_string(),
            revision: record.revision,
            reason: "a file is already attached".into(),
        });
    }
    ensure_path_free(conn, &file.path, Some(&record.id))?;

    let version = kind.is_versioned().then_some(1);
    if !ArtifactRepo::fill(conn, &record.id, record.revision, &file.path, file.size, version)? {
        return Err(revision_moved(&record));
    }
    let _ = ReclamationRepo::forget_path(conn, &file.path)?;

    let record = load(conn, &record.id)?;
    debug!(artifact_id = %record.id, ?version, "artifact attached");
    Ok(Applied {
        event: DomainEvent::ArtifactAttached {
            artifact_id: record.id.clone(),
            study_id: record.study_id.clone(),
            version: record.version,
        },
        record,
        released: None,
    })
}

/// Replace inside the caller's transaction.
pub(crate) fn replace_in(
    conn: &Connection,
    record: &ArtifactRecord,
    file: &FileRef,
    expected_revision: Option<i64>,
) -> Result<Applied> {
    validate_file(file)?;
    if let Some(expected) = expected_revision {
        if expected != record.revision {
            return Err(EngineError::Conflict {
                entity: "artifact",
                id: record.id.to_string(),
                revision: record.revision,
                reason: format!("caller saw revision {expected}"),
            });
        }
    }
    let Some(old_path) = record.file_path.clone() else {
        return Err(EngineError::ArtifactNotFound(format!(
            "{} has no file to replace",
            record.id
        )));
    };
    ensure_path_free(conn, &file.path, Some(&record.id))?;

    let version = record
        .kind
        .is_versioned()
        .then(|| record.version.unwrap_or(0).saturating_add(1));
    if !ArtifactRepo::fill(conn, &record.id, record.revision, &file.path, file.size, version)? {
        return Err(revision_moved(record));
    }
    let _ = ReclamationRepo::forget_path(conn, &file.path)?;

    let updated = load(conn, &record.id)?;
    debug!(artifact_id = %updated.id, ?version, "artifact replaced");
    Ok(Applied {
        event: DomainEvent::ArtifactReplaced {
            artifact_id: updated.id.clone(),
            study_id: updated.study_id.clone(),
            version: updated.version,
        },
        released: (old_path != file.path).then(|| Released {
            path: old_path,
            artifact_id: updated.id.clone(),
        }),
        record: updated,
    })
}

/// Attach if the record is empty, replace otherwise.
pub(crate) fn upsert_in(
    conn: &Connection,
    study_id: &StudyId,
    kind: ArtifactKind,
    file: &FileRef,
) -> Result<Applied> {
    match ArtifactRepo::get_for_study(conn, study_id, kind)? {
        Some(record) if record.has_file() => replace_in(conn, &record, file, None),
        _ => attach_in(conn, study_id, kind, file),
    }
}

/// Empty a record inside the caller's transaction. `None` if it was empty.
pub(crate) fn clear_in(conn: &Connection, record: &ArtifactRecord) -> Result<Option<Cleared>> {
    let Some(path) = record.file_path.clone() else {
        return Ok(None);
    };
    if !ArtifactRepo::clear(conn, &record.id, record.revision)? {
        return Err(revision_moved(record));
    }
    debug!(artifact_id = %record.id, freed = record.file_size, "artifact cleared");
    Ok(Some(Cleared {
        released: Released {
            path,
            artifact_id: record.id.clone(),
        },
        freed_bytes: record.file_size,
        event: DomainEvent::ArtifactDeleted {
            artifact_id: record.id.clone(),
            freed_bytes: record.file_size,
        },
    }))
}

/// Empty every record of a study inside the caller's transaction.
pub(crate) fn clear_study_in(conn: &Connection, study_id: &StudyId) -> Result<Vec<Cleared>> {
    let mut cleared = Vec::new();
    for record in ArtifactRepo::list_for_study(conn, study_id)? {
        if let Some(c) = clear_in(conn, &record)? {
            cleared.push(c);
        }
    }
    Ok(cleared)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
