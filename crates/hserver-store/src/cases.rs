//! Case State Machine.
//!
//! ```text
//! IN_PROGRESS ──► DONE
//!      │  └─────► REJECT
//!      └────────► CANCELLED   (refund + artifact reclaim)
//! ```
//!
//! Creation spends one credit and cancellation refunds it, each in the same
//! transaction as the status change. A case never exists without its spend
//! and is never CANCELLED without its refund.

use std::sync::Arc;

use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info, instrument};

use hserver_core::{ActorId, CaseId, DomainEvent, StudyId};
use hserver_settings::LedgerSettings;

use crate::artifacts::{self, ArtifactManager, Cleared, ReclaimFailure, Released};
use crate::errors::{EngineError, Result};
use crate::ledger;
use crate::sqlite::repositories::artifact::ArtifactRepo;
use crate::sqlite::repositories::case::{CaseRepo, ListCasesOptions};
use crate::sqlite::repositories::study::StudyRepo;
use crate::store::{Store, case_key, file_key, study_key};
use crate::types::{ArtifactKind, ArtifactRecord, CaseStatus, CreditCategory, FileRef, LedgerEntry, RusCase};

/// Outcome of a cancellation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelReport {
    /// The case, now CANCELLED.
    pub case: RusCase,
    /// The refund entry.
    pub refund: LedgerEntry,
    /// Bytes released from storage accounting.
    pub freed_bytes: u64,
    /// Files that could not be deleted; queued for reclamation.
    pub reclaim_failures: Vec<ReclaimFailure>,
}

/// Outcome of a soft delete.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteCaseReport {
    /// The case, now deleted.
    pub case: RusCase,
    /// Refund issued if the case was still IN_PROGRESS.
    pub refund: Option<LedgerEntry>,
    /// Bytes released from storage accounting.
    pub freed_bytes: u64,
    /// Files that could not be deleted; queued for reclamation.
    pub reclaim_failures: Vec<ReclaimFailure>,
}

/// Outcome of recording the worker's result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResultReport {
    /// The case after the result (DONE).
    pub case: RusCase,
    /// The RESULT artifact with its new version.
    pub artifact: ArtifactRecord,
    /// Set if the superseded result file could not be deleted.
    pub reclaim: Option<ReclaimFailure>,
}

/// Drives cases through their lifecycle.
#[derive(Clone)]
pub struct CaseStateMachine {
    store: Arc<Store>,
    artifacts: ArtifactManager,
    ledger: LedgerSettings,
}

impl CaseStateMachine {
    /// Create a state machine over `store`. File releases go through `artifacts`.
    pub fn new(store: Arc<Store>, artifacts: ArtifactManager, ledger: LedgerSettings) -> Self {
        Self {
            store,
            artifacts,
            ledger,
        }
    }

    /// Create a case against a materialized study and spend one credit.
    ///
    /// Fails with `NOT_FOUND_STUDY`, `DUPLICATE_CASE`, `NOT_FOUND_ARTIFACT`
    /// (raw data removed), or `INSUFFICIENT_CREDIT`; no case row exists
    /// after any failure.
    #[instrument(skip(self))]
    pub fn create_case(&self, study_id: &StudyId, owner: &ActorId) -> Result<RusCase> {
        let result = self.store.with_entity_and_ledger_lock(&study_key(study_id), || {
            self.store.write(|tx| {
                if StudyRepo::get_by_id(tx, study_id)?.is_none() {
                    return Err(EngineError::StudyNotFound(study_id.to_string()));
                }
                if let Some(existing) = CaseRepo::get_by_study(tx, study_id)? {
                    return Err(EngineError::DuplicateCase {
                        study_id: study_id.to_string(),
                        case_id: existing.id.to_string(),
                    });
                }
                let raw_present = ArtifactRepo::get_for_study(tx, study_id, ArtifactKind::Raw)?
                    .is_some_and(|r| r.has_file());
                if !raw_present {
                    return Err(EngineError::ArtifactNotFound(format!(
                        "raw data for study {study_id} has been removed"
                    )));
                }

                let case_id = CaseId::new();
                let (entry, balance) =
                    ledger::debit(tx, 1, CreditCategory::RusUse, Some(owner), Some(&case_id))?;
                let case = CaseRepo::insert(tx, &case_id, study_id, owner)?;
                Ok((case, entry, balance))
            })
        });

        let (case, entry, balance) = match result {
            Ok(ok) => ok,
            Err(err) => {
                if let Some(event) = ledger::insufficient_event(&err, Some(owner)) {
                    self.store.publish(&[event]);
                }
                return Err(err);
            }
        };

        info!(case_id = %case.id, study_id = %study_id, owner = %owner, "case created");
        let mut events = vec![DomainEvent::CaseCreated {
            case_id: case.id.clone(),
            study_id: study_id.clone(),
            owner: owner.clone(),
            entry_id: entry.id,
        }];
        events.extend(ledger::shortage_event(balance, self.ledger.shortage_threshold));
        self.store.publish(&events);
        Ok(case)
    }

    /// Move a case to `target`. CANCELLED is routed through [`cancel`](Self::cancel).
    #[instrument(skip(self))]
    pub fn transition(&self, case_id: &CaseId, target: CaseStatus) -> Result<RusCase> {
        if target == CaseStatus::Cancelled {
            return self.cancel(case_id).map(|report| report.case);
        }
        let (case, from) = self.store.with_entity_write_lock(&case_key(case_id), || {
            self.store.write(|tx| {
                let case = load_live(tx, case_id)?;
                if !case.status.can_transition_to(target) {
                    return Err(invalid_transition(&case, target));
                }
                set_status(tx, &case, target)?;
                Ok((load_live(tx, case_id)?, case.status))
            })
        })?;
        debug!(case_id = %case_id, %from, to = %target, "case transitioned");
        self.store.publish(&[DomainEvent::CaseTransitioned {
            case_id: case_id.clone(),
            from: from.to_string(),
            to: target.to_string(),
        }]);
        Ok(case)
    }

    /// Cancel an IN_PROGRESS case: refund its credit, clear both artifacts,
    /// and mark it CANCELLED in one transaction. Files are released after
    /// commit; failures are reported, not raised.
    ///
    /// A second cancel fails with `INVALID_STATE_TRANSITION` and changes nothing.
    #[instrument(skip(self))]
    pub fn cancel(&self, case_id: &CaseId) -> Result<CancelReport> {
        let (case, refund, cleared) = self.store.with_entity_and_ledger_lock(&case_key(case_id), || {
            self.store.write(|tx| {
                let case = load_live(tx, case_id)?;
                let refund = cancel_in(tx, &case)?;
                let cleared = artifacts::clear_study_in(tx, &case.study_id)?;
                Ok((load_live(tx, case_id)?, refund, cleared))
            })
        })?;

        let (released, freed_bytes, artifact_events) = split_cleared(cleared);
        let reclaim_failures = self.artifacts.release(&released);
        info!(case_id = %case_id, freed_bytes, failures = reclaim_failures.len(), "case cancelled");

        let mut events = vec![
            DomainEvent::CreditRefunded {
                entry_id: refund.id.clone(),
                subject: Some(case_id.clone()),
                quantity: refund.quantity,
            },
            DomainEvent::CaseCancelled {
                case_id: case_id.clone(),
                refund_entry_id: refund.id.clone(),
            },
        ];
        events.extend(artifact_events);
        self.store.publish(&events);
        Ok(CancelReport {
            case,
            refund,
            freed_bytes,
            reclaim_failures,
        })
    }

    /// Record the external worker's generated model. Attaches or replaces the
    /// RESULT artifact and moves an IN_PROGRESS case to DONE.
    ///
    /// `observed_version` is the result version the worker last saw (`None`
    /// for no result yet). Fails with `CONFLICT` if another result landed in
    /// between.
    #[instrument(skip(self))]
    pub fn record_result(
        &self,
        case_id: &CaseId,
        file: &FileRef,
        observed_version: Option<u32>,
    ) -> Result<ResultReport> {
        let (case, applied, transitioned) = self.store.holding_entity_lock(&file_key(&file.path), || {
            self.store.with_entity_write_lock(&case_key(case_id), || {
                self.store.write(|tx| {
                    let case = load_live(tx, case_id)?;
                    if !matches!(case.status, CaseStatus::InProgress | CaseStatus::Done) {
                        return Err(invalid_transition(&case, CaseStatus::Done));
                    }
                    ensure_result_version(tx, &case, observed_version)?;
                    let applied = artifacts::upsert_in(tx, &case.study_id, ArtifactKind::Result, file)?;
                    let transitioned = case.status == CaseStatus::InProgress;
                    if transitioned {
                        set_status(tx, &case, CaseStatus::Done)?;
                    }
                    Ok((load_live(tx, case_id)?, applied, transitioned))
                })
            })
        })?;

        let reclaim = self.artifacts.release(applied.released.as_slice()).into_iter().next();
        let mut events = vec![applied.event];
        if transitioned {
            events.push(DomainEvent::CaseTransitioned {
                case_id: case_id.clone(),
                from: CaseStatus::InProgress.to_string(),
                to: CaseStatus::Done.to_string(),
            });
        }
        self.store.publish(&events);
        Ok(ResultReport {
            case,
            artifact: applied.record,
            reclaim,
        })
    }

    /// Soft-delete a case. An IN_PROGRESS case is cancelled first; every case
    /// has its artifacts reclaimed. Deleting a deleted case is a no-op.
    #[instrument(skip(self))]
    pub fn delete_case(&self, case_id: &CaseId) -> Result<DeleteCaseReport> {
        let (case, refund, cleared, deleted_now) =
            self.store.with_entity_and_ledger_lock(&case_key(case_id), || {
                self.store.write(|tx| {
                    let case = CaseRepo::get_by_id(tx, case_id)?
                        .ok_or_else(|| EngineError::CaseNotFound(case_id.to_string()))?;
                    if case.deleted_at.is_some() {
                        return Ok((case, None, Vec::new(), false));
                    }
                    let refund = if case.status == CaseStatus::InProgress {
                        Some(cancel_in(tx, &case)?)
                    } else {
                        None
                    };
                    let cleared = artifacts::clear_study_in(tx, &case.study_id)?;
                    let _ = CaseRepo::mark_deleted(tx, case_id)?;
                    let case = CaseRepo::get_by_id(tx, case_id)?
                        .ok_or_else(|| EngineError::CaseNotFound(case_id.to_string()))?;
                    Ok((case, refund, cleared, true))
                })
            })?;

        if !deleted_now {
            debug!(case_id = %case_id, "case already deleted");
            return Ok(DeleteCaseReport {
                case,
                refund: None,
                freed_bytes: 0,
                reclaim_failures: Vec::new(),
            });
        }

        let (released, freed_bytes, artifact_events) = split_cleared(cleared);
        let reclaim_failures = self.artifacts.release(&released);
        info!(case_id = %case_id, refunded = refund.is_some(), freed_bytes, "case deleted");

        let mut events = Vec::new();
        if let Some(entry) = &refund {
            events.push(DomainEvent::CreditRefunded {
                entry_id: entry.id.clone(),
                subject: Some(case_id.clone()),
                quantity: entry.quantity,
            });
            events.push(DomainEvent::CaseCancelled {
                case_id: case_id.clone(),
                refund_entry_id: entry.id.clone(),
            });
        }
        events.extend(artifact_events);
        events.push(DomainEvent::CaseDeleted {
            case_id: case_id.clone(),
        });
        self.store.publish(&events);
        Ok(DeleteCaseReport {
            case,
            refund,
            freed_bytes,
            reclaim_failures,
        })
    }

    /// Get a live case.
    pub fn get(&self, case_id: &CaseId) -> Result<RusCase> {
        self.store.read(|conn| load_live(conn, case_id))
    }

    /// The case created against a study, deleted or not.
    pub fn find_by_study(&self, study_id: &StudyId) -> Result<Option<RusCase>> {
        self.store.read(|conn| CaseRepo::get_by_study(conn, study_id))
    }

    /// List cases, newest first.
    pub fn list(&self, opts: &ListCasesOptions<'_>) -> Result<Vec<RusCase>> {
        self.store.read(|conn| CaseRepo::list(conn, opts))
    }
}

fn load_live(conn: &Connection, case_id: &CaseId) -> Result<RusCase> {
    CaseRepo::get_by_id(conn, case_id)?
        .filter(|c| c.deleted_at.is_none())
        .ok_or_else(|| EngineError::CaseNotFound(case_id.to_string()))
}

fn invalid_transition(case: &RusCase, target: CaseStatus) -> EngineError {
    EngineError::InvalidStateTransition {
        entity: "case",
        id: case.id.to_string(),
        from: case.status.to_string(),
        to: target.to_string(),
    }
}

fn set_status(conn: &Connection, case: &RusCase, target: CaseStatus) -> Result<()> {
    if CaseRepo::update_status(conn, &case.id, case.status, target)? {
        Ok(())
    } else {
        Err(invalid_transition(case, target))
    }
}

/// IN_PROGRESS → CANCELLED plus the refund, inside the caller's transaction.
fn cancel_in(conn: &Connection, case: &RusCase) -> Result<LedgerEntry> {
    if !case.status.can_transition_to(CaseStatus::Cancelled) {
        return Err(invalid_transition(case, CaseStatus::Cancelled));
    }
    set_status(conn, case, CaseStatus::Cancelled)?;
    Ok(ledger::refund_in(conn, 1, None, &case.id)?.into_entry())
}

/// `CONFLICT` unless the RESULT artifact is still at `observed` version.
fn ensure_result_version(conn: &Connection, case: &RusCase, observed: Option<u32>) -> Result<()> {
    let current = ArtifactRepo::get_for_study(conn, &case.study_id, ArtifactKind::Result)?;
    let version = current.as_ref().and_then(|r| r.version);
    if version == observed {
        return Ok(());
    }
    Err(EngineError::Conflict {
        entity: "artifact",
        id: current.map_or_else(|| case.id.to_string(), |r| r.id.to_string()),
        revision: i64::from(version.unwrap_or(0)),
        reason: format!("worker saw result version {observed:?}, current is {version:?}"),
    })
}

fn split_cleared(cleared: Vec<Cleared>) -> (Vec<Released>, u64, Vec<DomainEvent>) {
    let mut released = Vec::with_capacity(cleared.len());
    let mut events = Vec::with_capacity(cleared.len());
    let mut freed = 0u64;
    for c in cleared {
        freed = freed.saturating_add(c.freed_bytes);
        released.push(c.released);
        events.push(c.event);
    }
    (released, freed, events)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use crate::files::FileStorage;
    use crate::files::testing::{MockStorage, permissive};
    use crate::ledger::LedgerEngine;
    use crate::sqlite::repositories::ledger::LedgerRepo;
    use crate::store::tests::setup;
    use crate::types::Study;
    use crate::upload_jobs::UploadJobTracker;
    use assert_matches::assert_matches;
    use hserver_core::{CollectingListener, ErrorKind};
    use hserver_settings::UploadSettings;
    use std::io;

    struct Harness {
        store: Arc<Store>,
        cases: CaseStateMachine,
        ledger: LedgerEngine,
        uploads: UploadJobTracker,
        avm: ArtifactManager,
        events: Arc<CollectingListener>,
    }

    fn harness_with(files: impl FileStorage + 'static) -> Harness {
        let store = Arc::new(setup());
        let events = Arc::new(CollectingListener::new("t"));
        store.events().register(events.clone());
        let avm = ArtifactManager::new(store.clone(), Arc::new(files));
        Harness {
            cases: CaseStateMachine::new(store.clone(), avm.clone(), LedgerSettings::default()),
            ledger: LedgerEngine::new(store.clone(), LedgerSettings::default()),
            uploads: UploadJobTracker::new(store.clone(), UploadSettings::default()),
            avm,
            store,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with(permissive())
    }

    impl Harness {
        fn study(&self) -> Study {
            let job = self.uploads.create(&Default::default()).unwrap().job;
            self.uploads
                .materialize(&job.id, &FileRef::new(format!("raw/{}.zip", job.hu_id), 1000))
                .unwrap()
        }

        fn case(&self) -> RusCase {
            self.ledger.allocate(5, None).unwrap();
            let study = self.study();
            self.cases.create_case(&study.id, &ActorId::from("userX")).unwrap()
        }
    }

    #[test]
    fn create_case_spends_one_credit() {
        let h = harness();
        h.ledger.allocate(5, Some(&ActorId::from("admin"))).unwrap();
        let study = h.study();
        h.events.clear();

        let case = h.cases.create_case(&study.id, &ActorId::from("userX")).unwrap();
        assert_eq!(case.status, CaseStatus::InProgress);
        assert_eq!(case.study_id, study.id);
        assert_eq!(h.ledger.balance().unwrap(), 4);

        let entries = h.ledger.entries_for(&case.id).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].quantity, -1);
        assert_eq!(h.events.names(), vec!["caseCreated"]);
    }

    #[test]
    fn create_case_without_credit_creates_nothing() {
        let h = harness();
        let study = h.study();
        h.events.clear();

        let err = h.cases.create_case(&study.id, &ActorId::from("userX")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientCredit);
        assert!(h.cases.find_by_study(&study.id).unwrap().is_none());
        assert_eq!(h.ledger.balance().unwrap(), 0);
        assert_eq!(h.events.names(), vec!["creditInsufficient"]);
    }

    #[test]
    fn create_case_errors() {
        let h = harness();
        h.ledger.allocate(5, None).unwrap();
        let owner = ActorId::from("u");

        assert_matches!(
            h.cases.create_case(&StudyId::from("study_nope"), &owner),
            Err(EngineError::StudyNotFound(_))
        );

        let study = h.study();
        h.cases.create_case(&study.id, &owner).unwrap();
        assert_matches!(
            h.cases.create_case(&study.id, &owner),
            Err(EngineError::DuplicateCase { .. })
        );
        // Only the successful creation spent.
        assert_eq!(h.ledger.balance().unwrap(), 4);
    }

    #[test]
    fn create_case_requires_raw_data() {
        let h = harness();
        h.ledger.allocate(5, None).unwrap();
        let study = h.study();
        let raw = h.avm.get_for_study(&study.id, ArtifactKind::Raw).unwrap().unwrap();
        h.avm.delete(&raw.id).unwrap();

        assert_matches!(
            h.cases.create_case(&study.id, &ActorId::from("u")),
            Err(EngineError::ArtifactNotFound(_))
        );
        assert_eq!(h.ledger.balance().unwrap(), 5);
    }

    #[test]
    fn shortage_emitted_on_case_creation() {
        let h = harness();
        h.ledger.allocate(10, None).unwrap();
        let study = h.study();
        h.events.clear();
        h.cases.create_case(&study.id, &ActorId::from("u")).unwrap();
        assert_eq!(h.events.names(), vec!["caseCreated", "creditShortage"]);
    }

    #[test]
    fn transitions_follow_the_table() {
        let h = harness();
        let case = h.case();
        let done = h.cases.transition(&case.id, CaseStatus::Done).unwrap();
        assert_eq!(done.status, CaseStatus::Done);

        for target in [CaseStatus::InProgress, CaseStatus::Reject, CaseStatus::Done] {
            let err = h.cases.transition(&case.id, target).unwrap_err();
            assert_matches!(
                err,
                EngineError::InvalidStateTransition { ref from, .. } if from == "DONE"
            );
        }
        assert_matches!(
            h.cases.transition(&case.id, CaseStatus::Cancelled),
            Err(EngineError::InvalidStateTransition { .. })
        );
    }

    #[test]
    fn reject_does_not_refund() {
        let h = harness();
        let case = h.case();
        h.cases.transition(&case.id, CaseStatus::Reject).unwrap();
        assert_eq!(h.ledger.balance().unwrap(), 4);
    }

    #[test]
    fn cancel_refunds_and_clears_artifacts() {
        let h = harness();
        h.ledger.allocate(5, None).unwrap();
        let study = h.study();
        let case = h.cases.create_case(&study.id, &ActorId::from("userX")).unwrap();
        assert_eq!(h.ledger.balance().unwrap(), 4);
        h.events.clear();

        let report = h.cases.cancel(&case.id).unwrap();
        assert_eq!(report.case.status, CaseStatus::Cancelled);
        assert_eq!(report.refund.quantity, 1);
        assert_eq!(report.refund.category, CreditCategory::Revoke);
        assert_eq!(report.refund.actor, None);
        assert_eq!(report.refund.subject.as_ref(), Some(&case.id));
        assert_eq!(report.freed_bytes, 1000);
        assert!(report.reclaim_failures.is_empty());
        assert_eq!(h.ledger.balance().unwrap(), 5);

        for record in h.avm.list_for_study(&study.id).unwrap() {
            assert!(!record.has_file());
        }
        assert_eq!(
            h.events.names(),
            vec!["creditRefunded", "caseCancelled", "artifactDeleted"]
        );
    }

    #[test]
    fn second_cancel_fails_without_side_effects() {
        let h = harness();
        let case = h.case();
        h.cases.cancel(&case.id).unwrap();
        let balance = h.ledger.balance().unwrap();
        let entries = h.store.read(LedgerRepo::count).unwrap();

        let err = h.cases.cancel(&case.id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);
        assert_eq!(h.ledger.balance().unwrap(), balance);
        assert_eq!(h.store.read(LedgerRepo::count).unwrap(), entries);
    }

    #[test]
    fn cancel_storage_failure_is_reported_not_raised() {
        let mut mock = MockStorage::new();
        mock.expect_delete_file()
            .returning(|_| Err(io::Error::other("disk offline")));
        let h = harness_with(mock);
        let case = h.case();

        let report = h.cases.cancel(&case.id).unwrap();
        assert_eq!(report.case.status, CaseStatus::Cancelled);
        assert_eq!(report.reclaim_failures.len(), 1);
        assert_eq!(report.reclaim_failures[0].kind(), ErrorKind::StorageDeleteFailed);
        assert_eq!(h.ledger.balance().unwrap(), 5);
        assert_eq!(h.avm.pending_reclamations().unwrap().len(), 1);
    }

    #[test]
    fn transition_to_cancelled_refunds() {
        let h = harness();
        let case = h.case();
        let cancelled = h.cases.transition(&case.id, CaseStatus::Cancelled).unwrap();
        assert_eq!(cancelled.status, CaseStatus::Cancelled);
        assert_eq!(h.ledger.balance().unwrap(), 5);
    }

    #[test]
    fn record_result_versions_and_completes() {
        let h = harness();
        let case = h.case();
        h.events.clear();

        let first = h.cases.record_result(&case.id, &FileRef::new("hu3d/v1.glb", 300), None).unwrap();
        assert_eq!(first.case.status, CaseStatus::Done);
        assert_eq!(first.artifact.version, Some(1));
        assert_eq!(h.events.names(), vec!["artifactAttached", "caseTransitioned"]);

        h.events.clear();
        let second = h.cases.record_result(&case.id, &FileRef::new("hu3d/v2.glb", 320), Some(1)).unwrap();
        assert_eq!(second.artifact.version, Some(2));
        assert_eq!(second.case.status, CaseStatus::Done);
        assert_eq!(h.events.names(), vec!["artifactReplaced"]);
    }

    #[test]
    fn stale_worker_result_conflicts() {
        let h = harness();
        let case = h.case();
        h.cases.record_result(&case.id, &FileRef::new("hu3d/a.glb", 10), None).unwrap();

        // A second worker that also saw no result loses.
        let err = h
            .cases
            .record_result(&case.id, &FileRef::new("hu3d/b.glb", 11), None)
            .unwrap_err();
        assert_matches!(err, EngineError::Conflict { entity: "artifact", .. });
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let stale = h.cases.record_result(&case.id, &FileRef::new("hu3d/c.glb", 12), Some(2));
        assert_eq!(stale.unwrap_err().kind(), ErrorKind::Conflict);

        let result = h.avm.get_for_study(&case.study_id, ArtifactKind::Result).unwrap().unwrap();
        assert_eq!(result.version, Some(1));
        assert_eq!(result.file_path.as_deref(), Some("hu3d/a.glb"));
    }

    #[test]
    fn record_result_rejected_for_cancelled_case() {
        let h = harness();
        let case = h.case();
        h.cases.cancel(&case.id).unwrap();
        assert_matches!(
            h.cases.record_result(&case.id, &FileRef::new("m.glb", 1), None),
            Err(EngineError::InvalidStateTransition { .. })
        );
    }

    #[test]
    fn delete_in_progress_case_refunds_first() {
        let h = harness();
        h.case();
        let other = {
            let study = h.study();
            h.cases.create_case(&study.id, &ActorId::from("u")).unwrap()
        };
        assert_eq!(h.ledger.balance().unwrap(), 3);

        let report = h.cases.delete_case(&other.id).unwrap();
        assert!(report.refund.is_some());
        assert_eq!(report.case.status, CaseStatus::Cancelled);
        assert!(report.case.deleted_at.is_some());
        assert_eq!(h.ledger.balance().unwrap(), 4);

        assert_matches!(h.cases.get(&other.id), Err(EngineError::CaseNotFound(_)));
        assert_matches!(
            h.cases.transition(&other.id, CaseStatus::Done),
            Err(EngineError::CaseNotFound(_))
        );
    }

    #[test]
    fn delete_done_case_reclaims_without_refund() {
        let h = harness();
        let case = h.case();
        h.cases.record_result(&case.id, &FileRef::new("m.glb", 10), None).unwrap();
        let balance = h.ledger.balance().unwrap();

        let report = h.cases.delete_case(&case.id).unwrap();
        assert!(report.refund.is_none());
        assert_eq!(report.freed_bytes, 1010);
        assert_eq!(report.case.status, CaseStatus::Done);
        assert_eq!(h.ledger.balance().unwrap(), balance);

        // Idempotent.
        let again = h.cases.delete_case(&case.id).unwrap();
        assert_eq!(again.freed_bytes, 0);
        assert!(again.refund.is_none());

        // The study stays bound to its deleted case.
        assert_matches!(
            h.cases.create_case(&case.study_id, &ActorId::from("u")),
            Err(EngineError::DuplicateCase { .. })
        );
    }

    #[test]
    fn list_hides_deleted() {
        let h = harness();
        let a = h.case();
        let b = h.case();
        h.cases.delete_case(&a.id).unwrap();
        let live = h.cases.list(&ListCasesOptions::default()).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, b.id);
    }
}
