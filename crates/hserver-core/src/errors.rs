//! Error kinds surfaced to callers.
//!
//! [`ErrorKind`] is the machine-readable taxonomy every component error maps
//! onto. Callers branch on the kind (retry, re-fetch, surface to the user)
//! while the concrete error value carries the entity ID and current state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine-readable error classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    // Business rules
    /// Balance too low for the requested spend.
    InsufficientCredit,
    /// Allocation would exceed the configured balance ceiling.
    LimitExceeded,

    // Caller errors
    /// Study reference does not resolve to a materialized study.
    NotFoundStudy,
    /// Case does not exist (or was deleted).
    NotFoundCase,
    /// Artifact does not exist, or its file is required but absent.
    NotFoundArtifact,
    /// Upload job does not exist.
    NotFoundJob,
    /// Requested status change is not allowed from the current status.
    InvalidStateTransition,
    /// The study already has a case.
    DuplicateCase,
    /// Another active job or study already holds the `StudyInstanceUID`.
    DuplicateStudyInstanceUid,
    /// Input rejected before touching the store.
    InvalidArgument,

    // Concurrency
    /// Optimistic precondition did not match the stored state.
    Conflict,

    // Infrastructure
    /// File deletion failed after the record was updated; queued for reclamation.
    StorageDeleteFailed,
    /// Store, pool, or serialization failure.
    Internal,
}

impl ErrorKind {
    /// Wire code for this kind.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::InsufficientCredit => "INSUFFICIENT_CREDIT",
            Self::LimitExceeded => "LIMIT_EXCEEDED",
            Self::NotFoundStudy => "NOT_FOUND_STUDY",
            Self::NotFoundCase => "NOT_FOUND_CASE",
            Self::NotFoundArtifact => "NOT_FOUND_ARTIFACT",
            Self::NotFoundJob => "NOT_FOUND_JOB",
            Self::InvalidStateTransition => "INVALID_STATE_TRANSITION",
            Self::DuplicateCase => "DUPLICATE_CASE",
            Self::DuplicateStudyInstanceUid => "DUPLICATE_STUDY_INSTANCE_UID",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::Conflict => "CONFLICT",
            Self::StorageDeleteFailed => "STORAGE_DELETE_FAILED",
            Self::Internal => "INTERNAL",
        }
    }

    /// Whether a caller may retry after re-fetching state.
    ///
    /// `INSUFFICIENT_CREDIT` is terminal and never retried automatically.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Conflict | Self::Internal)
    }

    /// Whether the failure was caused by the caller's input or stale view.
    #[must_use]
    pub fn is_caller_error(self) -> bool {
        matches!(
            self,
            Self::NotFoundStudy
                | Self::NotFoundCase
                | Self::NotFoundArtifact
                | Self::NotFoundJob
                | Self::InvalidStateTransition
                | Self::DuplicateCase
                | Self::DuplicateStudyInstanceUid
                | Self::InvalidArgument
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
