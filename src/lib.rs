//! Distributed Transaction Coordinator
//!
//! Drives multi-participant operations (Saga, TCC, XA and resumable
//! workflows) to an all-committed or all-compensated outcome, and gives
//! participants a branch barrier that makes at-least-once branch delivery safe.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // 1. Participant: wrap the local effect in a barrier
//! impl BranchHandler for TransIn {
//!     async fn handle(&self, req: &BranchRequest) -> BranchResult {
//!         BranchBarrier::from_request(req)
//!             .call_with_store(&self.ledger, |tx| credit(tx, req))
//!             .into()
//!     }
//! }
//!
//! // 2. Coordinator: route targets and submit
//! let invoker = Arc::new(LocalInvoker::new());
//! invoker.route("busi/TransIn", Arc::new(TransIn::new(ledger)));
//! let coordinator = Coordinator::new(CoordinatorConfig::default(), store, invoker)?;
//!
//! let saga = TransDefinition::saga(gid)
//!     .add("busi/TransOut", "busi/TransOutRevert", body.clone())
//!     .add("busi/TransIn", "busi/TransInRevert", body);
//! coordinator.submit(saga).await?;
//!
//! // 3. Recovery: finish whatever a pass left pending
//! tokio::spawn(async move { scheduler.run(shutdown).await });
//! ```

#![warn(missing_docs)]

// === Core Types ===
mod errors;
mod trans;

// === Barrier ===
mod barrier;
mod ledger;

// === Storage ===
mod codec;
#[cfg(feature = "lmdb")]
mod lmdb;
mod store;

// === Protocols ===
mod invoker;
mod protocol;
mod workflow;

// === Dispatch ===
mod coordinator;
mod cron;
mod engine;

// === Configuration ===
mod clock;
mod config;

// === Observability ===
mod observer;
mod stats;

// === Re-exports ===

// Types
pub use trans::{branch_id, Branch, BranchOp, BranchStatus, Protocol, TransGlobal, TransStatus};

// Errors
pub use errors::{
    BarrierError, BranchError, CoordinatorError, LedgerError, StoreError, TransportError,
};

// Barrier
pub use barrier::{
    BarrierKey, BarrierOutcome, BarrierStore, BarrierTx, BranchBarrier, LedgerRow,
    LocalTransaction, PreparedState, PREPARED_BARRIER_ID, PREPARED_BRANCH_ID,
};
pub use ledger::{InMemoryLedger, MemoryTx};

// Storage
pub use store::{InMemoryTransStore, TransStore};
#[cfg(feature = "lmdb")]
pub use lmdb::{open_env, LmdbLedger, LmdbTransStore, LmdbTx};

// Protocols
pub use invoker::{BranchHandler, BranchInvoker, BranchRequest, BranchResult, LocalInvoker};
pub use protocol::{
    DriverStep, ProtocolPolicy, SagaPolicy, StepPlan, TransDefinition, TwoPhasePolicy,
    WorkflowPolicy, TCC_POLICY, XA_POLICY,
};
pub use workflow::{StepDescriptor, Workflow, WorkflowError, WorkflowHandler};

// Dispatch
pub use coordinator::{Coordinator, CoordinatorBuilder};
pub use cron::RecoveryScheduler;

// Configuration
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CoordinatorConfig, RetryPolicy};

// Observability
pub use observer::{NoOpObserver, TracingObserver, TransObserver};
pub use stats::{CoordinatorStats, CoordinatorStatsSnapshot};
