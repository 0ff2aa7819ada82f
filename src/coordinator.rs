//! Coordinator facade
//!
//! ```rust,ignore
//! let invoker = Arc::new(LocalInvoker::new());
//! invoker.route("busi/TransOut", Arc::new(TransOut));
//! invoker.route("busi/TransOutRevert", Arc::new(TransOutRevert));
//!
//! let coordinator = Coordinator::new(
//!     CoordinatorConfig::default(),
//!     Arc::new(InMemoryTransStore::new()),
//!     invoker,
//! )?;
//!
//! let saga = TransDefinition::saga("gid-1").add("busi/TransOut", "busi/TransOutRevert", body);
//! let status = coordinator.submit_and_wait(saga).await?;
//!
//! // Drive unfinished transactions in the background
//! let (stop, stopped) = tokio::sync::watch::channel(false);
//! tokio::spawn({
//!     let scheduler = coordinator.scheduler();
//!     async move { scheduler.run(stopped).await }
//! });
//! ```

use crate::engine::Engine;
use crate::{
    BranchInvoker, Clock, CoordinatorConfig, CoordinatorError, CoordinatorStatsSnapshot,
    RecoveryScheduler, StoreError, SystemClock, TracingObserver, TransDefinition, TransGlobal,
    TransObserver, TransStatus, TransStore, WorkflowHandler,
};
use std::sync::Arc;

/// Builder for a [`Coordinator`] with a custom clock or observer
pub struct CoordinatorBuilder {
    config: CoordinatorConfig,
    store: Arc<dyn TransStore>,
    invoker: Arc<dyn BranchInvoker>,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn TransObserver>,
}

impl CoordinatorBuilder {
    /// Replace the system clock
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the tracing observer
    pub fn observer(mut self, observer: Arc<dyn TransObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Validate the configuration and assemble the coordinator
    pub fn build(self) -> Result<Coordinator, CoordinatorError> {
        self.config.validate()?;
        Ok(Coordinator {
            engine: Arc::new(Engine::new(
                self.config,
                self.store,
                self.invoker,
                self.clock,
                self.observer,
            )),
        })
    }
}

/// Entry point for submitting and querying global transactions
#[derive(Clone)]
pub struct Coordinator {
    engine: Arc<Engine>,
}

impl Coordinator {
    /// Coordinator on the system clock, logging through `tracing`
    pub fn new(
        config: CoordinatorConfig,
        store: Arc<dyn TransStore>,
        invoker: Arc<dyn BranchInvoker>,
    ) -> Result<Self, CoordinatorError> {
        Self::builder(config, store, invoker).build()
    }

    /// Builder with the system clock and a [`TracingObserver`](crate::TracingObserver)
    pub fn builder(
        config: CoordinatorConfig,
        store: Arc<dyn TransStore>,
        invoker: Arc<dyn BranchInvoker>,
    ) -> CoordinatorBuilder {
        CoordinatorBuilder {
            config,
            store,
            invoker,
            clock: Arc::new(SystemClock),
            observer: Arc::new(TracingObserver),
        }
    }

    /// Persist the transaction and dispatch it in the background.
    ///
    /// Returns once the record is durable. Resubmitting a gid with the same
    /// protocol is a no-op.
    pub async fn submit(&self, definition: TransDefinition) -> Result<String, CoordinatorError> {
        let trans = self.engine.create(definition.into_trans(self.engine.now_millis())?)?;
        let gid = trans.gid.clone();
        if !trans.status.is_terminal() {
            let engine = self.engine.clone();
            tokio::spawn(async move {
                let gid = trans.gid.clone();
                if let Err(e) = engine.process(trans).await {
                    tracing::debug!(gid = %gid, error = %e, "First pass left for recovery");
                }
            });
        }
        Ok(gid)
    }

    /// Persist the transaction and run its first pass inline
    pub async fn submit_and_wait(&self, definition: TransDefinition) -> Result<TransStatus, CoordinatorError> {
        let trans = self.engine.create(definition.into_trans(self.engine.now_millis())?)?;
        Ok(self.engine.process(trans).await?.status)
    }

    /// Current record, including branch statuses
    pub fn query_status(&self, gid: &str) -> Result<TransGlobal, CoordinatorError> {
        self.engine
            .store
            .load(gid)?
            .ok_or_else(|| StoreError::NotFound(gid.to_string()).into())
    }

    /// Associate a workflow function with `name`
    pub fn register_workflow(&self, name: impl Into<String>, handler: Arc<dyn WorkflowHandler>) {
        self.engine.register_workflow(name, handler);
    }

    /// Start workflow `name` under `gid` and wait for its first pass.
    ///
    /// Returns `Ok` once the workflow succeeded (commit steps may still be
    /// pending), `Failure` when it took the rollback path, and `Ongoing` when
    /// recovery has to finish it.
    pub async fn execute_workflow(
        &self,
        gid: &str,
        name: &str,
        payload: Vec<u8>,
    ) -> Result<(), CoordinatorError> {
        let trans = self.engine.execute_workflow(gid, name, payload).await?;
        match (trans.status, trans.rollback_reason) {
            (TransStatus::Succeed | TransStatus::Submitted, _) => Ok(()),
            (_, Some(reason)) => Err(CoordinatorError::Failure(reason)),
            _ => Err(CoordinatorError::Ongoing),
        }
    }

    /// Run a pass on every unfinished transaction, as after a restart.
    /// Returns how many were resumed.
    pub async fn recover(&self) -> Result<usize, CoordinatorError> {
        let gids = self.engine.store.list_unfinished()?;
        let mut resumed = 0;
        for gid in gids {
            let Some(trans) = self.engine.store.load(&gid)? else {
                continue;
            };
            match self.engine.process(trans).await {
                Ok(_) => resumed += 1,
                Err(e) if e.is_retryable() => {
                    tracing::debug!(gid = %gid, error = %e, "Resume interrupted");
                }
                Err(e) => {
                    tracing::warn!(gid = %gid, error = %e, "Resume failed");
                }
            }
        }
        tracing::info!(resumed, "Unfinished transactions resumed");
        Ok(resumed)
    }

    /// Scheduler driving this coordinator's unfinished transactions
    pub fn scheduler(&self) -> RecoveryScheduler {
        RecoveryScheduler::new(self.engine.clone())
    }

    /// Snapshot of the dispatch counters
    pub fn stats(&self) -> CoordinatorStatsSnapshot {
        self.engine.stats.snapshot()
    }
}
