//! Wiring for the five components over one store.

use std::sync::Arc;

use tracing::info;

use hserver_core::EventBus;
use hserver_settings::HserverSettings;

use crate::artifacts::ArtifactManager;
use crate::cases::CaseStateMachine;
use crate::errors::Result;
use crate::files::FileStorage;
use crate::ledger::LedgerEngine;
use crate::sqlite::connection::{ConnectionConfig, ConnectionPool, new_file, new_in_memory};
use crate::sqlite::migrations::{current_version, run_migrations};
use crate::storage::StorageAccountant;
use crate::store::Store;
use crate::upload_jobs::UploadJobTracker;

/// The case pipeline: every component sharing one pool, lock set, and event bus.
#[derive(Clone)]
pub struct Engine {
    store: Arc<Store>,
    ledger: LedgerEngine,
    artifacts: ArtifactManager,
    uploads: UploadJobTracker,
    cases: CaseStateMachine,
    storage: StorageAccountant,
}

impl Engine {
    /// Open the database named by `settings` (in memory when no path is set),
    /// bring its schema up to date, and build every component.
    pub fn open(settings: &HserverSettings, files: Arc<dyn FileStorage>) -> Result<Self> {
        let config = ConnectionConfig::from(&settings.database);
        let pool = match settings.database.path.as_deref() {
            Some(path) => new_file(path, &config)?,
            None => new_in_memory(&config)?,
        };
        Self::from_pool(pool, settings, files)
    }

    /// Build over an existing pool. Migrations are applied.
    pub fn from_pool(
        pool: ConnectionPool,
        settings: &HserverSettings,
        files: Arc<dyn FileStorage>,
    ) -> Result<Self> {
        let (applied, version) = {
            let conn = pool.get()?;
            let applied = run_migrations(&conn)?;
            (applied, current_version(&conn)?)
        };
        info!(schema_version = version, applied, "store ready");

        let store = Arc::new(Store::new(pool, Arc::new(EventBus::new())));
        let artifacts = ArtifactManager::new(store.clone(), files);
        Ok(Self {
            ledger: LedgerEngine::new(store.clone(), settings.ledger.clone()),
            uploads: UploadJobTracker::new(store.clone(), settings.upload.clone()),
            cases: CaseStateMachine::new(store.clone(), artifacts.clone(), settings.ledger.clone()),
            storage: StorageAccountant::new(store.clone(), settings.storage.clone()),
            artifacts,
            store,
        })
    }

    /// Ledger Engine.
    pub fn ledger(&self) -> &LedgerEngine {
        &self.ledger
    }

    /// Artifact Version Manager.
    pub fn artifacts(&self) -> &ArtifactManager {
        &self.artifacts
    }

    /// Upload Job Tracker.
    pub fn uploads(&self) -> &UploadJobTracker {
        &self.uploads
    }

    /// Case State Machine.
    pub fn cases(&self) -> &CaseStateMachine {
        &self.cases
    }

    /// Storage Accountant.
    pub fn storage(&self) -> &StorageAccountant {
        &self.storage
    }

    /// Register listeners here to receive domain events.
    pub fn events(&self) -> &Arc<EventBus> {
        self.store.events()
    }

    /// The shared store.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }
}
