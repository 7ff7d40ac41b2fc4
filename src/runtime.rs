//! Process-wide runtime wiring
//!
//! The optimizer, broker, and daemon are constructed once here and
//! passed explicitly into hooks; there are no global singletons.
//! Lifecycle: `Runtime::initialize` at process start, `shutdown` on
//! exit.

use crate::cache::{CacheOptimizer, HookResult};
use crate::config::HermesConfig;
use crate::daemon::{WorkerContext, WorkerDaemon};
use crate::error::{HermesError, Result};
use crate::handoff::HandoffManager;
use crate::store::PersistentStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub struct Runtime {
    config: HermesConfig,
    store: Arc<PersistentStore>,
    optimizer: Arc<CacheOptimizer>,
    manager: Arc<HandoffManager>,
    daemon: Arc<WorkerDaemon>,
}

impl Runtime {
    /// Build and initialize every subsystem
    pub async fn initialize(config: HermesConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| HermesError::Configuration(e.to_string()))?;

        let store = PersistentStore::open(&config.store)?;

        let optimizer = Arc::new(CacheOptimizer::new(config.clone())?);
        optimizer.initialize().await?;

        let manager = HandoffManager::new(config.clone(), store.clone())?;
        manager.initialize().await?;

        let project_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let ctx = WorkerContext {
            project_dir,
            metrics_dir: store.metrics_dir(),
            optimizer: Some(optimizer.clone()),
            handoff: Some(manager.clone()),
        };
        let daemon = WorkerDaemon::new(
            config.workers.clone(),
            config.resource_thresholds.clone(),
            store.clone(),
            ctx,
        )?;

        info!("Hermes runtime initialized");
        Ok(Self {
            config,
            store,
            optimizer,
            manager,
            daemon,
        })
    }

    pub fn config(&self) -> &HermesConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<PersistentStore> {
        &self.store
    }

    pub fn optimizer(&self) -> &Arc<CacheOptimizer> {
        &self.optimizer
    }

    pub fn manager(&self) -> &Arc<HandoffManager> {
        &self.manager
    }

    pub fn daemon(&self) -> &Arc<WorkerDaemon> {
        &self.daemon
    }

    /// Hook entry: a user prompt is about to be processed
    pub async fn on_user_prompt_submit(&self, prompt: &str, session_id: &str) -> HookResult {
        self.optimizer.on_user_prompt_submit(prompt, session_id).await
    }

    /// Hook entry: a forced context compaction is imminent
    pub async fn on_pre_compact(&self) -> HookResult {
        self.optimizer.on_pre_compact().await
    }

    /// Stop every subsystem and flush state
    pub async fn shutdown(&self) {
        self.daemon.stop().await;
        self.manager.shutdown().await;
        self.store.close();
        info!("Hermes runtime shut down");
    }
}
