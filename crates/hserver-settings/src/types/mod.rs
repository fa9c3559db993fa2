//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and implement
//! [`Default`] with production values. `#[serde(default)]` allows partial
//! JSON: missing fields keep their default during deserialization.

mod pipeline;
mod runtime;

pub use pipeline::*;
pub use runtime::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings value.
///
/// Built once by the binary and handed to each component at construction;
/// nothing reads configuration from process-global state.
///
/// ```json
/// {
///   "ledger": { "shortageThreshold": 5 },
///   "upload": { "serverCode": "D00042ug_sto" }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HserverSettings {
    /// Database connection settings.
    pub database: DatabaseSettings,
    /// Credit ledger settings.
    pub ledger: LedgerSettings,
    /// Artifact storage settings.
    pub storage: StorageSettings,
    /// Upload intake settings.
    pub upload: UploadSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

impl HserverSettings {
    /// Reject combinations no component can work with.
    pub fn validate(&self) -> Result<()> {
        if self.database.pool_size == 0 {
            return Err(SettingsError::invalid("database.poolSize", "must be at least 1"));
        }
        if self.ledger.shortage_threshold < 0 {
            return Err(SettingsError::invalid("ledger.shortageThreshold", "must be >= 0"));
        }
        match self.ledger.max_balance {
            Some(max) if max < 0 => {
                return Err(SettingsError::invalid(
                    "ledger.maxBalance",
                    format!("must be >= 0, got {max}"),
                ));
            }
            _ => {}
        }
        if self.upload.server_code.trim().is_empty() {
            return Err(SettingsError::invalid("upload.serverCode", "must not be empty"));
        }
        if self.upload.job_timeout_ms == 0 {
            return Err(SettingsError::invalid("upload.jobTimeoutMs", "must be positive"));
        }
        Ok(())
    }
}
