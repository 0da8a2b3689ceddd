//! Application context
//!
//! Everything the engines share is built once here and handed out as an
//! `Arc<Context>`. `start()` opens the scheduler for work; `shutdown()`
//! cancels outstanding polls and jobs and waits for them to drain.

use std::path::Path;
use std::sync::Arc;

use crate::config::TransferConfig;
use crate::error::Result;
use crate::record::{Part, TransferRecord};
use crate::remote::ColdStorage;
use crate::scheduler::Scheduler;
use crate::store::{JsonFileStore, MemoryStore, ObservableStore, RecordStore};
use crate::waiter::Waiter;

/// Shared services for the transfer engines
pub struct Context {
    /// Validated configuration
    pub config: TransferConfig,
    /// Rate-limited job runner
    pub scheduler: Scheduler,
    /// Completion poller on top of `scheduler`
    pub waiter: Waiter,
    /// Transfer records, observable for progress display
    pub records: Arc<ObservableStore<TransferRecord>>,
    /// Chunk records
    pub parts: Arc<dyn RecordStore<Part>>,
    /// Storage service client
    pub remote: Arc<dyn ColdStorage>,
}

impl Context {
    /// Assemble a context from explicit stores
    ///
    /// # Errors
    ///
    /// Returns [`crate::TransferError::InvalidConfig`] if `config` is invalid.
    pub fn new(
        config: TransferConfig,
        records: Arc<dyn RecordStore<TransferRecord>>,
        parts: Arc<dyn RecordStore<Part>>,
        remote: Arc<dyn ColdStorage>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let scheduler = Scheduler::new(&config);
        let waiter = Waiter::new(scheduler.clone(), &config);

        Ok(Arc::new(Self {
            config,
            scheduler,
            waiter,
            records: Arc::new(ObservableStore::new(records)),
            parts,
            remote,
        }))
    }

    /// Context backed by in-memory stores
    ///
    /// # Errors
    ///
    /// Returns [`crate::TransferError::InvalidConfig`] if `config` is invalid.
    pub fn in_memory(config: TransferConfig, remote: Arc<dyn ColdStorage>) -> Result<Arc<Self>> {
        Self::new(
            config,
            Arc::new(MemoryStore::<TransferRecord>::new()),
            Arc::new(MemoryStore::<Part>::new()),
            remote,
        )
    }

    /// Context backed by JSON record files under `state_dir`
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the state
    /// directories cannot be opened.
    pub async fn open(
        config: TransferConfig,
        state_dir: &Path,
        remote: Arc<dyn ColdStorage>,
    ) -> Result<Arc<Self>> {
        let records: JsonFileStore<TransferRecord> =
            JsonFileStore::open(state_dir.join("transfers")).await?;
        let parts: JsonFileStore<Part> = JsonFileStore::open(state_dir.join("parts")).await?;
        Self::new(config, Arc::new(records), Arc::new(parts), remote)
    }

    /// Open the scheduler for work
    pub fn start(&self) {
        self.scheduler.start();
        tracing::info!(
            rps = self.config.requests_per_second,
            parts = self.config.maximum_active_parts,
            "Transfer context started"
        );
    }

    /// Cancel all polls and jobs and wait for them to drain
    pub async fn shutdown(&self) {
        self.waiter.stop().await;
        tracing::info!("Transfer context shut down");
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}
