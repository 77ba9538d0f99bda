//! The RTI: the set of live federation executions and the save store they
//! share.

use crate::callback::CallbackQueue;
use crate::error::{FederationError, StoreError};
use crate::execution::FederationExecution;
use crate::store::{FileSaveStore, MemorySaveStore, SaveStore};
use ohla_core::{logging, Fdd, FederateHandle, LogicalTime, RtiConfig, SaveBackend};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// What a successful join hands back to the federate.
pub struct JoinedFederate {
    pub handle: FederateHandle,
    pub execution: Arc<FederationExecution>,
    pub callbacks: CallbackQueue,
}

pub struct Rti {
    executions: RwLock<HashMap<String, Arc<FederationExecution>>>,
    store: Arc<dyn SaveStore>,
    initial_time: LogicalTime,
}

impl Rti {
    pub fn new(store: Arc<dyn SaveStore>, initial_time: LogicalTime) -> Self {
        Self {
            executions: RwLock::new(HashMap::new()),
            store,
            initial_time,
        }
    }

    /// RTI keeping saves in memory, federates starting at time zero.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemorySaveStore::new()), LogicalTime::INITIAL)
    }

    pub fn from_config(config: &RtiConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn SaveStore> = match config.save.backend {
            SaveBackend::Memory => Arc::new(MemorySaveStore::new()),
            SaveBackend::File => Arc::new(FileSaveStore::new(&config.save.directory)?),
            #[cfg(feature = "sqlite")]
            SaveBackend::Sqlite => Arc::new(crate::store::SqliteSaveStore::open(
                config.save.directory.join("saves.db"),
            )?),
            #[cfg(not(feature = "sqlite"))]
            SaveBackend::Sqlite => return Err(StoreError::BackendUnavailable("sqlite")),
        };
        info!(backend = ?config.save.backend, initial_time = config.time.initial_time, "RTI configured");
        Ok(Self::new(store, LogicalTime(config.time.initial_time)))
    }

    /// Load the configuration at `path`, install its logging setup and build
    /// the RTI. An already installed subscriber is kept.
    pub fn from_config_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let config = RtiConfig::from_file(path)?;
        if let Err(e) = logging::init_with(&config.logging) {
            debug!(error = %e, "Keeping the installed subscriber");
        }
        Ok(Self::from_config(&config)?)
    }

    pub async fn create_federation_execution(
        &self,
        name: &str,
        fdd: Fdd,
    ) -> Result<Arc<FederationExecution>, FederationError> {
        let mut executions = self.executions.write().await;
        if executions.contains_key(name) {
            return Err(FederationError::FederationExecutionAlreadyExists(
                name.to_string(),
            ));
        }
        let execution = Arc::new(FederationExecution::new(
            name.to_string(),
            fdd,
            Arc::clone(&self.store),
            self.initial_time,
        ));
        executions.insert(name.to_string(), Arc::clone(&execution));
        info!(federation = %name, "Federation execution created");
        Ok(execution)
    }

    /// Only possible once every federate has resigned.
    pub async fn destroy_federation_execution(&self, name: &str) -> Result<(), FederationError> {
        let mut executions = self.executions.write().await;
        let execution = executions
            .get(name)
            .ok_or_else(|| FederationError::FederationExecutionDoesNotExist(name.to_string()))?;
        if execution.federate_count().await > 0 {
            return Err(FederationError::FederatesCurrentlyJoined(name.to_string()));
        }
        executions.remove(name);
        info!(federation = %name, "Federation execution destroyed");
        Ok(())
    }

    /// Join `federation`. Without a name one is generated from the handle.
    pub async fn join_federation_execution(
        &self,
        federation: &str,
        name: Option<&str>,
        federate_type: &str,
    ) -> Result<JoinedFederate, FederationError> {
        let executions = self.executions.read().await;
        let execution = executions.get(federation).cloned().ok_or_else(|| {
            FederationError::FederationExecutionDoesNotExist(federation.to_string())
        })?;
        let (handle, callbacks) = execution.join(name, federate_type).await?;
        drop(executions);
        Ok(JoinedFederate {
            handle,
            execution,
            callbacks,
        })
    }

    pub async fn federation_execution(&self, name: &str) -> Option<Arc<FederationExecution>> {
        self.executions.read().await.get(name).cloned()
    }

    pub async fn federation_execution_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executions.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}
