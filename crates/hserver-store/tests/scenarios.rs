//! End-to-end scenarios over the public `Engine` API.

#![allow(unused_results)]

use std::sync::Arc;

use assert_matches::assert_matches;
use tempfile::TempDir;

use hserver_core::{ActorId, CollectingListener, ErrorKind, StudyId};
use hserver_settings::HserverSettings;
use hserver_store::{
    ArtifactKind, CaseStatus, CreditCategory, Engine, EngineError, FileRef, LocalFileStorage,
    RawMetadata,
};

fn in_memory() -> (Engine, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(
        &HserverSettings::default(),
        Arc::new(LocalFileStorage::new(dir.path())),
    )
    .unwrap();
    (engine, dir)
}

fn file_backed() -> (Engine, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = HserverSettings::default();
    settings.database.path = Some(dir.path().join("hserver.db").to_string_lossy().into_owned());
    let engine = Engine::open(&settings, Arc::new(LocalFileStorage::new(dir.path().join("files")))).unwrap();
    (engine, dir)
}

fn study(engine: &Engine, uid: Option<&str>) -> StudyId {
    let job = engine
        .uploads()
        .create(&RawMetadata {
            study_instance_uid: uid.map(str::to_string),
            ..Default::default()
        })
        .unwrap()
        .job;
    engine
        .uploads()
        .materialize(&job.id, &FileRef::new(format!("raw/{}.zip", job.hu_id), 1_000))
        .unwrap()
        .id
}

// ─────────────────────────────────────────────────────────────────────────────
// Ledger scenarios
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn scenario_a_spend_on_empty_ledger() {
    let (engine, _dir) = in_memory();
    let err = engine
        .ledger()
        .spend(1, Some(&ActorId::from("userX")), None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientCredit);
    assert_eq!(engine.ledger().balance().unwrap(), 0);
    assert_eq!(engine.ledger().history(&Default::default()).unwrap().total, 0);
}

#[test]
fn scenario_b_allocate_spend_cancel() {
    let (engine, _dir) = in_memory();
    engine.ledger().allocate(5, Some(&ActorId::from("admin"))).unwrap();
    assert_eq!(engine.ledger().balance().unwrap(), 5);

    let study = study(&engine, Some("1.2.840.1"));
    let case = engine.cases().create_case(&study, &ActorId::from("userX")).unwrap();
    assert_eq!(engine.ledger().balance().unwrap(), 4);

    let report = engine.cases().cancel(&case.id).unwrap();
    assert_eq!(report.refund.category, CreditCategory::Revoke);
    assert_eq!(report.refund.subject.as_ref(), Some(&case.id));
    assert_eq!(engine.ledger().balance().unwrap(), 5);
}

#[test]
fn scenario_c_result_versions() {
    let (engine, _dir) = in_memory();
    let study = study(&engine, None);
    let avm = engine.artifacts();

    let attached = avm
        .attach(&study, ArtifactKind::Result, &FileRef::new("/a/1.bin", 100))
        .unwrap();
    assert_eq!(attached.version, Some(1));

    let replaced = avm
        .replace(&attached.id, &FileRef::new("/a/2.bin", 150), Some(attached.revision))
        .unwrap();
    assert_eq!(replaced.artifact.version, Some(2));
    assert_eq!(replaced.artifact.file_size, 150);

    let deleted = avm.delete(&attached.id).unwrap();
    assert_eq!(deleted.artifact.file_path, None);
    assert_eq!(deleted.artifact.file_size, 0);
    assert_eq!(deleted.artifact.version, None);
    assert_eq!(deleted.freed_bytes, 150);
}

#[test]
fn scenario_d_concurrent_spends() {
    let (engine, _dir) = file_backed();
    engine.ledger().allocate(10, None).unwrap();
    let engine = Arc::new(engine);

    let threads: Vec<_> = (0..50)
        .map(|i| {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                let actor = ActorId::from(format!("user-{i}").as_str());
                engine.ledger().spend(1, Some(&actor), None)
            })
        })
        .collect();

    let mut ok = 0;
    let mut insufficient = 0;
    for handle in threads {
        match handle.join().unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::InsufficientCredit { .. }) => insufficient += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(ok, 10);
    assert_eq!(insufficient, 40);
    assert_eq!(engine.ledger().balance().unwrap(), 0);
}

#[test]
fn concurrent_case_creation_never_overdraws() {
    let (engine, _dir) = file_backed();
    engine.ledger().allocate(5, None).unwrap();
    let studies: Vec<StudyId> = (0..20).map(|_| study(&engine, None)).collect();
    let engine = Arc::new(engine);

    let threads: Vec<_> = studies
        .into_iter()
        .map(|study| {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || engine.cases().create_case(&study, &ActorId::from("u")))
        })
        .collect();

    let created = threads
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(Result::is_ok)
        .count();
    assert_eq!(created, 5);
    assert_eq!(engine.ledger().balance().unwrap(), 0);
    assert_eq!(engine.cases().list(&Default::default()).unwrap().len(), 5);
}

// ─────────────────────────────────────────────────────────────────────────────
// Case lifecycle
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn concurrent_cancel_refunds_once() {
    let (engine, _dir) = file_backed();
    engine.ledger().allocate(1, None).unwrap();
    let study = study(&engine, None);
    let case = engine.cases().create_case(&study, &ActorId::from("u")).unwrap();
    let engine = Arc::new(engine);

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let id = case.id.clone();
            std::thread::spawn(move || engine.cases().cancel(&id))
        })
        .collect();
    let results: Vec<_> = threads.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);
    }
    assert_eq!(engine.ledger().balance().unwrap(), 1);

    let entries = engine.ledger().entries_for(&case.id).unwrap();
    let refunds = entries
        .iter()
        .filter(|e| e.category == CreditCategory::Revoke)
        .count();
    assert_eq!(refunds, 1);
    assert_eq!(engine.cases().get(&case.id).unwrap().status, CaseStatus::Cancelled);
}

#[test]
fn worker_result_then_delete() {
    let (engine, _dir) = in_memory();
    engine.ledger().allocate(3, None).unwrap();
    let study = study(&engine, None);
    let case = engine.cases().create_case(&study, &ActorId::from("u")).unwrap();

    let v1 = engine
        .cases()
        .record_result(&case.id, &FileRef::new("hu3d/1.glb", 40), None)
        .unwrap();
    let v2 = engine
        .cases()
        .record_result(&case.id, &FileRef::new("hu3d/2.glb", 60), v1.artifact.version)
        .unwrap();
    assert_eq!(v1.artifact.version, Some(1));
    assert_eq!(v2.artifact.version, Some(2));
    assert_eq!(v2.case.status, CaseStatus::Done);

    let before = engine.storage().usage(10_000).unwrap();
    assert_eq!(before.used, 1_060);

    let report = engine.cases().delete_case(&case.id).unwrap();
    assert!(report.refund.is_none());
    assert_eq!(report.freed_bytes, 1_060);
    assert_eq!(engine.storage().usage(10_000).unwrap().used, 0);
    assert_eq!(engine.ledger().balance().unwrap(), 2);
    assert_matches!(engine.cases().get(&case.id), Err(EngineError::CaseNotFound(_)));
}

// ─────────────────────────────────────────────────────────────────────────────
// Artifacts and storage
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn delete_conserves_storage_usage() {
    let (engine, _dir) = in_memory();
    let a = study(&engine, None);
    study(&engine, None);
    let result = engine
        .artifacts()
        .attach(&a, ArtifactKind::Result, &FileRef::new("hu3d/a.glb", 333))
        .unwrap();

    let before = engine.storage().usage(1 << 20).unwrap().used;
    engine.artifacts().delete(&result.id).unwrap();
    let after = engine.storage().usage(1 << 20).unwrap().used;
    assert_eq!(before - after, 333);
}

#[test]
fn ingest_writes_through_local_storage() {
    let (engine, dir) = in_memory();
    let study = study(&engine, None);
    let change = engine
        .artifacts()
        .ingest(&study, ArtifactKind::Result, "hu3d/model.glb", b"glTF-binary")
        .unwrap();
    assert_eq!(change.artifact.file_size, 11);
    assert!(dir.path().join("hu3d/model.glb").exists());

    engine
        .artifacts()
        .ingest(&study, ArtifactKind::Result, "hu3d/model-2.glb", b"glTF")
        .unwrap();
    assert!(!dir.path().join("hu3d/model.glb").exists());
    assert!(dir.path().join("hu3d/model-2.glb").exists());
}

#[test]
fn stale_revision_conflicts() {
    let (engine, _dir) = in_memory();
    let study = study(&engine, None);
    let avm = engine.artifacts();
    let first = avm
        .attach(&study, ArtifactKind::Result, &FileRef::new("hu3d/1.glb", 1))
        .unwrap();
    avm.replace(&first.id, &FileRef::new("hu3d/2.glb", 2), Some(first.revision))
        .unwrap();

    let err = avm
        .replace(&first.id, &FileRef::new("hu3d/3.glb", 3), Some(first.revision))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(avm.get(&first.id).unwrap().version, Some(2));
}

// ─────────────────────────────────────────────────────────────────────────────
// Upload intake
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn dedup_returns_same_hu_id() {
    let (engine, _dir) = in_memory();
    let meta = RawMetadata {
        study_instance_uid: Some("1.2.3".into()),
        ..Default::default()
    };
    let first = engine.uploads().create(&meta).unwrap();
    let second = engine.uploads().create(&meta).unwrap();
    assert!(first.affected);
    assert!(!second.affected);
    assert_eq!(first.job.hu_id, second.job.hu_id);
}

#[test]
fn events_reach_listeners_after_commit() {
    let (engine, _dir) = in_memory();
    let events = Arc::new(CollectingListener::new("audit"));
    engine.events().register(events.clone());

    let study = study(&engine, None);
    events.clear();
    let err = engine.cases().create_case(&study, &ActorId::from("u")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientCredit);
    assert_eq!(events.names(), vec!["creditInsufficient"]);
}
