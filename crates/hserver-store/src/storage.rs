//! Storage Accountant: read-only aggregation of artifact bytes.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use hserver_core::DomainEvent;
use hserver_settings::StorageSettings;

use crate::errors::Result;
use crate::sqlite::repositories::artifact::ArtifactRepo;
use crate::store::Store;
use crate::types::StorageUsage;

/// Result of a low-storage check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LowStorageCheck {
    /// Usage the check was made against.
    pub usage: StorageUsage,
    /// Configured threshold.
    pub threshold: u64,
    /// Whether free space is below the threshold.
    pub low: bool,
}

/// Computes used/free/total over every artifact with a present file.
#[derive(Clone)]
pub struct StorageAccountant {
    store: Arc<Store>,
    settings: StorageSettings,
}

impl StorageAccountant {
    /// Create an accountant over `store`.
    pub fn new(store: Arc<Store>, settings: StorageSettings) -> Self {
        Self { store, settings }
    }

    /// Usage against a caller-supplied capacity. `free` saturates at 0.
    pub fn usage(&self, total: u64) -> Result<StorageUsage> {
        let totals = self.store.read(ArtifactRepo::usage)?;
        let used = totals.raw.saturating_add(totals.result);
        Ok(StorageUsage {
            used,
            free: total.saturating_sub(used),
            total,
            raw_used: totals.raw,
            result_used: totals.result,
        })
    }

    /// Usage against the configured capacity.
    pub fn usage_with_configured(&self) -> Result<StorageUsage> {
        self.usage(self.settings.total_capacity_bytes)
    }

    /// Emit `LowStorage` if free space is below the configured threshold.
    pub fn check_low_storage(&self, total: u64) -> Result<LowStorageCheck> {
        let usage = self.usage(total)?;
        let threshold = self.settings.low_storage_threshold_bytes;
        let low = usage.free < threshold;
        if low {
            warn!(free = usage.free, threshold, "storage running low");
            self.store.publish(&[DomainEvent::LowStorage {
                free: usage.free,
                threshold,
            }]);
        } else {
            debug!(free = usage.free, threshold, "storage ok");
        }
        Ok(LowStorageCheck {
            usage,
            threshold,
            low,
        })
    }
}
