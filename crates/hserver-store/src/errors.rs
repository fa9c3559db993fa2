//! Error types for the store and its components.
//!
//! [`EngineError`] is returned by every operation. Each variant carries the
//! entity ID and, where relevant, the state it was found in; [`EngineError::kind`]
//! maps it onto the caller-facing [`ErrorKind`] taxonomy.

use hserver_core::ErrorKind;
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// `SQLite` database error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool error.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// JSON serialization/deserialization error.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// File storage I/O error outside a reclamation path.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Schema migration failed.
    #[error("migration error: {message}")]
    Migration {
        /// Describes which migration failed and why.
        message: String,
    },

    /// Input rejected before touching the store.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Spend or reclaim would make the balance negative.
    #[error("insufficient credit: requested {requested}, balance {balance}")]
    InsufficientCredit {
        /// Units requested.
        requested: i64,
        /// Balance at the time of the check.
        balance: i64,
    },

    /// Allocation would exceed the configured ceiling.
    #[error("credit limit exceeded: requested {requested}, balance {balance}, limit {limit}")]
    LimitExceeded {
        /// Units requested.
        requested: i64,
        /// Balance at the time of the check.
        balance: i64,
        /// Configured ceiling.
        limit: i64,
    },

    /// Study does not exist.
    #[error("study not found: {0}")]
    StudyNotFound(String),

    /// Case does not exist or was deleted.
    #[error("case not found: {0}")]
    CaseNotFound(String),

    /// Artifact does not exist, or a required file is absent.
    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),

    /// Upload job does not exist.
    #[error("upload job not found: {0}")]
    JobNotFound(String),

    /// Status change not allowed from the current status.
    #[error("invalid state transition for {entity} {id}: {from} -> {to}")]
    InvalidStateTransition {
        /// Entity kind (`case`, `upload job`).
        entity: &'static str,
        /// Entity ID.
        id: String,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// The study already has a case.
    #[error("study {study_id} already has case {case_id}")]
    DuplicateCase {
        /// Study.
        study_id: String,
        /// Existing case.
        case_id: String,
    },

    /// The `StudyInstanceUID` is already held.
    #[error("studyInstanceUID {study_instance_uid} already held by {holder}")]
    DuplicateStudyInstanceUid {
        /// The contested UID.
        study_instance_uid: String,
        /// Job or study currently holding it.
        holder: String,
    },

    /// Optimistic precondition mismatch.
    #[error("conflict on {entity} {id} at revision {revision}: {reason}")]
    Conflict {
        /// Entity kind.
        entity: &'static str,
        /// Entity ID.
        id: String,
        /// Revision currently stored.
        revision: i64,
        /// Which precondition failed.
        reason: String,
    },

    /// File deletion failed after the owning record was updated.
    #[error("storage delete failed for {path}: {reason}")]
    StorageDeleteFailed {
        /// File path.
        path: String,
        /// Underlying failure.
        reason: String,
    },

    /// Internal error (e.g. poisoned lock).
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Caller-facing classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InsufficientCredit { .. } => ErrorKind::InsufficientCredit,
            Self::LimitExceeded { .. } => ErrorKind::LimitExceeded,
            Self::StudyNotFound(_) => ErrorKind::NotFoundStudy,
            Self::CaseNotFound(_) => ErrorKind::NotFoundCase,
            Self::ArtifactNotFound(_) => ErrorKind::NotFoundArtifact,
            Self::JobNotFound(_) => ErrorKind::NotFoundJob,
            Self::InvalidStateTransition { .. } => ErrorKind::InvalidStateTransition,
            Self::DuplicateCase { .. } => ErrorKind::DuplicateCase,
            Self::DuplicateStudyInstanceUid { .. } => ErrorKind::DuplicateStudyInstanceUid,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::StorageDeleteFailed { .. } => ErrorKind::StorageDeleteFailed,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Sqlite(_)
            | Self::Pool(_)
            | Self::Serde(_)
            | Self::Io(_)
            | Self::Migration { .. }
            | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether this is `SQLITE_BUSY` / `SQLITE_LOCKED`.
    pub(crate) fn is_sqlite_busy_or_locked(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(code, _)) => matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Convenience type alias for store results.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Whether a `rusqlite` error is a constraint violation (UNIQUE, CHECK, trigger).
pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(code, _)
            if code.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(code: i32) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None)
    }

    #[test]
    fn insufficient_credit_display_and_kind() {
        let err = EngineError::InsufficientCredit {
            requested: 1,
            balance: 0,
        };
        assert_eq!(err.to_string(), "insufficient credit: requested 1, balance 0");
        assert_eq!(err.kind(), ErrorKind::InsufficientCredit);
        assert!(!err.kind().is_retryable());
    }

    #[test]
    fn invalid_transition_carries_state() {
        let err = EngineError::InvalidStateTransition {
            entity: "case",
            id: "case_1".into(),
            from: "CANCELLED".into(),
            to: "CANCELLED".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid state transition for case case_1: CANCELLED -> CANCELLED"
        );
        assert_eq!(err.kind().code(), "INVALID_STATE_TRANSITION");
    }

    #[test]
    fn not_found_kinds() {
        assert_eq!(EngineError::StudyNotFound("s".into()).kind(), ErrorKind::NotFoundStudy);
        assert_eq!(EngineError::CaseNotFound("c".into()).kind(), ErrorKind::NotFoundCase);
        assert_eq!(
            EngineError::ArtifactNotFound("a".into()).kind(),
            ErrorKind::NotFoundArtifact
        );
        assert_eq!(EngineError::JobNotFound("j".into()).kind(), ErrorKind::NotFoundJob);
    }

    #[test]
    fn conflict_is_retryable() {
        let err = EngineError::Conflict {
            entity: "artifact",
            id: "art_1".into(),
            revision: 3,
            reason: "caller saw revision 2".into(),
        };
        assert!(err.kind().is_retryable());
        assert!(err.to_string().contains("at revision 3: caller saw revision 2"));
    }

    #[test]
    fn infrastructure_errors_are_internal() {
        let err: EngineError = rusqlite::Error::QueryReturnedNoRows.into();
        assert_eq!(err.kind(), ErrorKind::Internal);
        let err = EngineError::Migration {
            message: "v001 failed".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn busy_and_locked_detected() {
        assert!(EngineError::Sqlite(sqlite_failure(rusqlite::ffi::SQLITE_BUSY)).is_sqlite_busy_or_locked());
        assert!(EngineError::Sqlite(sqlite_failure(rusqlite::ffi::SQLITE_LOCKED)).is_sqlite_busy_or_locked());
        assert!(!EngineError::Sqlite(sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT)).is_sqlite_busy_or_locked());
        assert!(!EngineError::Internal("x".into()).is_sqlite_busy_or_locked());
    }

    #[test]
    fn constraint_violation_detected() {
        assert!(is_constraint_violation(&sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT)));
        assert!(!is_constraint_violation(&sqlite_failure(rusqlite::ffi::SQLITE_BUSY)));
    }
}
