//! Domain records and their status enums.
//!
//! Records reference each other by ID only. Status enums round-trip through
//! `SQLite` as their upper-snake-case names.

use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use hserver_core::{ActorId, ArtifactId, CaseId, EntryId, JobId, StudyId};

macro_rules! sql_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                $(#[$vmeta])*
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            /// Stored and wire representation.
            #[must_use]
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {}: {other}", stringify!($name))),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: String| FromSqlError::Other(e.into()))
            }
        }
    };
}

sql_enum! {
    /// What a ledger entry represents.
    CreditCategory {
        /// Credit added by an administrator or licensing service.
        Allocate => "ALLOCATE",
        /// One unit consumed by case creation.
        RusUse => "RUS_USE",
        /// Refund of a prior spend.
        Revoke => "REVOKE",
        /// Unused credit withdrawn by an administrator.
        Reclaim => "RECLAIM",
    }
}

sql_enum! {
    /// Lifecycle status of a case.
    CaseStatus {
        /// Waiting for the external worker's result.
        InProgress => "IN_PROGRESS",
        /// Result delivered.
        Done => "DONE",
        /// Rejected by validation or the worker.
        Reject => "REJECT",
        /// Cancelled by the user; credit refunded.
        Cancelled => "CANCELLED",
    }
}

impl CaseStatus {
    /// Whether no further transition is allowed.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }

    /// Whether `self → target` is an edge of the case state machine.
    #[must_use]
    pub fn can_transition_to(self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::InProgress, Self::Done | Self::Reject | Self::Cancelled)
        )
    }
}

sql_enum! {
    /// Which file of a study an artifact record tracks.
    ArtifactKind {
        /// Uploaded source data. Never versioned.
        Raw => "RAW",
        /// Generated 3D model. Versioned.
        Result => "RESULT",
    }
}

impl ArtifactKind {
    /// Whether records of this kind carry a version.
    #[must_use]
    pub fn is_versioned(self) -> bool {
        matches!(self, Self::Result)
    }
}

sql_enum! {
    /// Lifecycle status of an upload job.
    UploadJobStatus {
        /// Receiving data.
        InProgress => "IN_PROGRESS",
        /// Study materialized.
        Done => "DONE",
        /// Failed validation or timed out.
        Reject => "REJECT",
    }
}

/// One immutable credit fact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    /// Entry ID.
    pub id: EntryId,
    /// Insertion order.
    pub seq: i64,
    /// Signed units; negative for spends and reclaims.
    pub quantity: i64,
    /// Category.
    pub category: CreditCategory,
    /// Whether the entry counts toward the balance.
    pub committed: bool,
    /// Who caused it; `None` for system actions.
    pub actor: Option<ActorId>,
    /// Case the entry relates to.
    pub subject: Option<CaseId>,
    /// RFC 3339 timestamp.
    pub created_at: String,
}

/// A ledger entry with the committed balance after it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// The entry.
    #[serde(flatten)]
    pub entry: LedgerEntry,
    /// Balance once this entry (and all before it) is applied.
    pub balance_after: i64,
}

/// A page of ledger history.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    /// Entries in the requested order.
    pub entries: Vec<HistoryEntry>,
    /// Entries matching the filter, ignoring paging.
    pub total: i64,
}

/// A case in the pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RusCase {
    /// Case ID.
    pub id: CaseId,
    /// Study the case was created against. Never changes.
    pub study_id: StudyId,
    /// Owner.
    pub owner: ActorId,
    /// Current status.
    pub status: CaseStatus,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// RFC 3339 time of the last change.
    pub updated_at: String,
    /// Set once the case is soft-deleted.
    pub deleted_at: Option<String>,
}

/// A file slot attached to a study.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRecord {
    /// Artifact ID.
    pub id: ArtifactId,
    /// Owning study (and therefore its case).
    pub study_id: StudyId,
    /// Raw input or generated result.
    pub kind: ArtifactKind,
    /// Present file, if any.
    pub file_path: Option<String>,
    /// Bytes; 0 when no file is present.
    pub file_size: u64,
    /// Result version; `None` before the first attach and after delete.
    pub version: Option<u32>,
    /// Optimistic-concurrency token, bumped on every mutation.
    pub revision: i64,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// RFC 3339 time of the last change.
    pub updated_at: String,
}

impl ArtifactRecord {
    /// Whether a file is currently present.
    #[must_use]
    pub fn has_file(&self) -> bool {
        self.file_path.is_some()
    }
}

/// A file reported by an uploader or the external worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRef {
    /// Storage path.
    pub path: String,
    /// Size in bytes; must be positive.
    pub size: u64,
}

impl FileRef {
    /// Build a file reference.
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
        }
    }
}

/// A materialized study.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Study {
    /// Study ID.
    pub id: StudyId,
    /// Business identifier copied from the upload job.
    pub hu_id: String,
    /// DICOM `StudyInstanceUID`, when known.
    pub study_instance_uid: Option<String>,
    /// Job the study came from.
    pub upload_job_id: Option<JobId>,
    /// RFC 3339 creation time.
    pub created_at: String,
}

/// Metadata supplied when raw data first arrives.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMetadata {
    /// Deduplication key.
    pub study_instance_uid: Option<String>,
    /// Where the data came from (AE title, `local`, ...).
    pub source: Option<String>,
    /// Number of DICOM instances announced.
    pub instances_count: Option<u32>,
}

/// Tracked ingestion of one raw study.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadJob {
    /// Job ID.
    pub id: JobId,
    /// Business identifier, assigned once.
    pub hu_id: String,
    /// Deduplication key.
    pub study_instance_uid: Option<String>,
    /// Where the data came from.
    pub source: Option<String>,
    /// Number of DICOM instances announced.
    pub instances_count: Option<u32>,
    /// Current status.
    pub status: UploadJobStatus,
    /// Whether a requester holds the huId.
    pub acquired: bool,
    /// Rejection reason.
    pub message: Option<String>,
    /// Study produced by the job.
    pub study_id: Option<StudyId>,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// RFC 3339 time of the last change.
    pub updated_at: String,
}

/// Space used by artifacts against a capacity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageUsage {
    /// Bytes held by present files.
    pub used: u64,
    /// `total - used`, floored at 0.
    pub free: u64,
    /// Capacity supplied by the caller.
    pub total: u64,
    /// Bytes held by raw input files.
    pub raw_used: u64,
    /// Bytes held by result files.
    pub result_used: u64,
}

/// Convert a stored byte count, clamping corrupt negatives to 0.
pub(crate) fn bytes_from_sql(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Convert a byte count for storage.
pub(crate) fn bytes_to_sql(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Current time as RFC 3339.
pub(crate) fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
