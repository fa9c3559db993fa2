//! Settings for the ledger, artifact storage, and upload intake.

use serde::{Deserialize, Serialize};

/// 1 GiB in bytes.
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Credit ledger settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LedgerSettings {
    /// Optional ceiling on the balance. When set, an allocation that would
    /// push the balance above it fails with `LIMIT_EXCEEDED`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_balance: Option<i64>,
    /// A spend that leaves exactly this many units emits `CreditShortage`.
    pub shortage_threshold: i64,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            max_balance: None,
            shortage_threshold: 9,
        }
    }
}

/// Artifact storage settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// Root directory the local file storage writes under.
    pub root_dir: String,
    /// Capacity used when the caller does not supply one.
    pub total_capacity_bytes: u64,
    /// Free space below which `LowStorage` is emitted.
    pub low_storage_threshold_bytes: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            root_dir: "storage".to_string(),
            total_capacity_bytes: 1024 * GIB,
            low_storage_threshold_bytes: 10 * GIB,
        }
    }
}

/// Upload intake settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadSettings {
    /// Prefix of every huId issued by this server (`{serverCode}_{n}`).
    pub server_code: String,
    /// First index issued when no job exists yet for the server code.
    pub hu_id_start_index: u64,
    /// In-progress jobs older than this are expired to REJECT.
    pub job_timeout_ms: u64,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            server_code: "D00000ug_sto".to_string(),
            hu_id_start_index: 1,
            job_timeout_ms: 3_600_000,
        }
    }
}
