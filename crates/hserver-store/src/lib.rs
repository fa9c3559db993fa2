//! # hserver-store
//!
//! The case pipeline's transactional core over `SQLite`:
//!
//! - **[`ledger`]**: append-only credit log; spend, refund, allocate, reclaim
//! - **[`cases`]**: case lifecycle with atomic spend-on-create and refund-on-cancel
//! - **[`artifacts`]**: raw and result files per study, versioned results, storage reclaim
//! - **[`upload_jobs`]**: huId issuance, `StudyInstanceUID` dedup, study materialization
//! - **[`storage`]**: used/free/total aggregation
//!
//! [`Engine`] wires all five over one [`Store`]. Every state change commits
//! in a single transaction and publishes its [`hserver_core::DomainEvent`]s
//! afterwards.
//!
//! ## Concurrency
//!
//! Balance-affecting writes hold one process-wide ledger lock and run in
//! `BEGIN IMMEDIATE` transactions. Per-entity writes hold a lock keyed by the
//! entity. A schema trigger rejects any committed ledger row that would make
//! the balance negative, so the invariant holds across processes too.

#![deny(unsafe_code)]

pub mod artifacts;
pub mod cases;
pub mod engine;
pub mod errors;
pub mod files;
pub mod ledger;
pub mod sqlite;
pub mod storage;
pub mod store;
pub mod types;
pub mod upload_jobs;

pub use artifacts::{ArtifactChange, ArtifactManager, DeleteReport, ReclaimFailure, ReclamationSummary};
pub use cases::{CancelReport, CaseStateMachine, DeleteCaseReport, ResultReport};
pub use engine::Engine;
pub use errors::{EngineError, Result};
pub use files::{DeleteOutcome, FileStorage, LocalFileStorage};
pub use ledger::{LedgerEngine, LowBalance};
pub use sqlite::repositories::case::ListCasesOptions;
pub use sqlite::repositories::ledger::{HistoryFilter, SortOrder};
pub use sqlite::repositories::reclamation::PendingReclamation;
pub use sqlite::{ConnectionConfig, ConnectionPool};
pub use storage::{LowStorageCheck, StorageAccountant};
pub use store::Store;
pub use types::{
    ArtifactKind, ArtifactRecord, CaseStatus, CreditCategory, FileRef, HistoryEntry, HistoryPage,
    LedgerEntry, RawMetadata, RusCase, StorageUsage, Study, UploadJob, UploadJobStatus,
};
pub use upload_jobs::{CreateJobResult, TIMED_OUT, UploadJobTracker};
