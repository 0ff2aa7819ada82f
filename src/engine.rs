//! Dispatch engine
//!
//! A dispatch pass loads nothing by itself: it is handed a record (freshly
//! submitted, claimed by the scheduler, or resumed at startup) and drives it
//! as far as it can go without waiting. Every branch attempt and every status
//! change is written through [`Engine::persist`] before the pass moves on, so
//! a crash at any point leaves a record the next pass can resume from.

use crate::protocol::DriverStep;
use crate::workflow::{Workflow, WorkflowError, WorkflowHandler};
use crate::{
    BranchInvoker, BranchRequest, BranchResult, BranchStatus, Clock, CoordinatorConfig,
    CoordinatorError, CoordinatorStats, Protocol, StoreError, TransGlobal, TransObserver, TransStatus,
    TransStore, TransportError,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub(crate) struct Engine {
    pub(crate) store: Arc<dyn TransStore>,
    pub(crate) invoker: Arc<dyn BranchInvoker>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: CoordinatorConfig,
    pub(crate) observer: Arc<dyn TransObserver>,
    pub(crate) stats: Arc<CoordinatorStats>,
    workflows: RwLock<HashMap<String, Arc<dyn WorkflowHandler>>>,
}

impl Engine {
    pub(crate) fn new(
        config: CoordinatorConfig,
        store: Arc<dyn TransStore>,
        invoker: Arc<dyn BranchInvoker>,
        clock: Arc<dyn Clock>,
        observer: Arc<dyn TransObserver>,
    ) -> Self {
        Self {
            store,
            invoker,
            clock,
            config,
            observer,
            stats: Arc::new(CoordinatorStats::new()),
            workflows: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    // === Workflow registry ===

    pub(crate) fn register_workflow(&self, name: impl Into<String>, handler: Arc<dyn WorkflowHandler>) {
        let name = name.into();
        if let Ok(mut workflows) = self.workflows.write() {
            tracing::debug!(workflow = %name, "Workflow registered");
            workflows.insert(name, handler);
        }
    }

    pub(crate) fn workflow(&self, name: &str) -> Result<Arc<dyn WorkflowHandler>, CoordinatorError> {
        self.workflows
            .read()
            .map_err(|e| CoordinatorError::Store(StoreError::Storage(e.to_string().into())))?
            .get(name)
            .cloned()
            .ok_or_else(|| CoordinatorError::UnknownWorkflow(name.to_string()))
    }

    // === Submission ===

    /// Persist a new record, or return the stored one when the same gid was
    /// already submitted under the same protocol.
    pub(crate) fn create(&self, mut trans: TransGlobal) -> Result<TransGlobal, CoordinatorError> {
        // The submitting caller dispatches the first pass itself; keep the
        // scheduler away from the record until the lease runs out.
        trans.next_cron_time_millis = trans.created_at_millis + self.config.lease_millis;

        match self.store.create(&trans) {
            Ok(()) => {
                CoordinatorStats::incr(&self.stats.submitted);
                self.observer.on_submitted(&trans);
                Ok(trans)
            }
            Err(StoreError::AlreadyExists(gid)) => {
                let existing = self
                    .store
                    .load(&gid)?
                    .ok_or_else(|| StoreError::NotFound(gid.clone()))?;
                if existing.protocol != trans.protocol {
                    return Err(CoordinatorError::Conflict(gid));
                }
                tracing::debug!(gid = %gid, status = %existing.status, "Resubmission of existing transaction");
                Ok(existing)
            }
            Err(e) => Err(e.into()),
        }
    }

    // === Dispatch ===

    /// Run one dispatch pass and return the record as last persisted
    pub(crate) async fn process(&self, mut trans: TransGlobal) -> Result<TransGlobal, CoordinatorError> {
        if trans.status.is_terminal() {
            return Ok(trans);
        }
        CoordinatorStats::incr(&self.stats.passes);
        let policy = trans.protocol.policy();

        if policy.in_forward_phase(&trans) && self.config.retry.is_exhausted(trans.retry_count) {
            CoordinatorStats::incr(&self.stats.retries_exhausted);
            self.observer.on_retry_exhausted(&trans);
            let reason = format!("retries exhausted after {} passes without progress", trans.retry_count);
            self.abort(&mut trans, &reason)?;
        }

        loop {
            match policy.next_step(&trans) {
                DriverStep::Transition(status) if status == trans.status => break,
                DriverStep::Transition(TransStatus::Aborting) => {
                    let reason = trans
                        .branches
                        .iter()
                        .find_map(|b| b.error.clone())
                        .unwrap_or_else(|| "branch failed".to_string());
                    self.abort(&mut trans, &reason)?;
                }
                DriverStep::Transition(status) => {
                    self.transition(&mut trans, status)?;
                    if status.is_terminal() {
                        break;
                    }
                }
                DriverStep::Invoke(index) => match self.invoke_branch(&mut trans, index).await? {
                    BranchResult::Success(_) => {}
                    BranchResult::Failure(reason) if trans.branches[index].op.is_forward() => {
                        self.abort(&mut trans, &reason)?;
                    }
                    BranchResult::Failure(_) | BranchResult::Ongoing => break,
                },
                DriverStep::RunWorkflow => {
                    if !self.run_workflow(&mut trans).await? {
                        break;
                    }
                }
            }
        }

        if !trans.status.is_terminal() {
            self.schedule_retry(&mut trans)?;
        }
        Ok(trans)
    }

    /// Run the workflow function once. Returns whether the pass should go on.
    async fn run_workflow(&self, trans: &mut TransGlobal) -> Result<bool, CoordinatorError> {
        let name = trans
            .workflow_name
            .clone()
            .ok_or_else(|| CoordinatorError::UnknownWorkflow(format!("<unnamed> ({})", trans.gid)))?;
        let handler = self.workflow(&name)?;
        let payload = trans.payload.clone();

        let result = {
            let mut wf = Workflow::new(self, trans);
            handler.run(&mut wf, &payload).await
        };

        match result {
            Ok(()) => {
                self.transition(trans, TransStatus::Submitted)?;
                Ok(true)
            }
            Err(WorkflowError::Failure(reason)) => {
                self.abort(trans, &reason)?;
                Ok(true)
            }
            Err(WorkflowError::Ongoing) => {
                tracing::debug!(gid = %trans.gid, workflow = %name, "Workflow ongoing");
                Ok(false)
            }
            Err(WorkflowError::Store(e)) => Err(e.into()),
        }
    }

    /// Call the branch at `index`, recording the attempt before the call and
    /// the result after it.
    ///
    /// A branch reaching a final status counts as progress and clears the
    /// pass counter, so the retry bound only covers passes that stalled.
    pub(crate) async fn invoke_branch(
        &self,
        trans: &mut TransGlobal,
        index: usize,
    ) -> Result<BranchResult, StoreError> {
        trans.branches[index].attempts += 1;
        self.persist(trans)?;

        let branch = &trans.branches[index];
        let request = BranchRequest {
            protocol: trans.protocol,
            gid: trans.gid.clone(),
            branch_id: branch.branch_id.clone(),
            op: branch.op,
            target: branch.target.clone(),
            payload: branch.payload.clone(),
        };
        let result = self.call(&request).await;
        let now = self.now_millis();

        match &result {
            BranchResult::Success(body) => {
                let branch = &mut trans.branches[index];
                branch.status = BranchStatus::Succeed;
                branch.result = body.clone();
                branch.error = None;
                branch.finished_at_millis = Some(now);
                trans.retry_count = 0;
                self.persist(trans)?;
                CoordinatorStats::incr(&self.stats.branch_successes);
                self.observer.on_branch_succeeded(trans, &trans.branches[index]);
            }
            BranchResult::Failure(reason) => {
                let branch = &mut trans.branches[index];
                branch.error = Some(reason.clone());
                if branch.op.is_forward() {
                    branch.status = BranchStatus::Failed;
                    branch.finished_at_millis = Some(now);
                    trans.retry_count = 0;
                }
                self.persist(trans)?;
                CoordinatorStats::incr(&self.stats.branch_failures);
                self.observer.on_branch_failed(trans, &trans.branches[index], reason);
            }
            BranchResult::Ongoing => {
                CoordinatorStats::incr(&self.stats.branch_pending);
                self.observer.on_branch_pending(trans, &trans.branches[index], "ongoing");
            }
        }
        Ok(result)
    }

    /// Deliver one call. Transport errors and timeouts read as `Ongoing`.
    async fn call(&self, request: &BranchRequest) -> BranchResult {
        CoordinatorStats::incr(&self.stats.branch_calls);
        let timeout = self.config.branch_timeout();
        let delivered = match tokio::time::timeout(timeout, self.invoker.invoke(request)).await {
            Ok(delivered) => delivered,
            Err(_) => Err(TransportError::Timeout(self.config.branch_timeout_millis)),
        };
        match delivered {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(gid = %request.gid, branch_id = %request.branch_id, op = %request.op, error = %e, "Branch call failed");
                BranchResult::Ongoing
            }
        }
    }

    // === Status bookkeeping ===

    fn transition(&self, trans: &mut TransGlobal, status: TransStatus) -> Result<(), StoreError> {
        let from = trans.status;
        trans.change_status(status, self.now_millis());
        self.persist(trans)?;
        match status {
            TransStatus::Succeed => CoordinatorStats::incr(&self.stats.succeeded),
            TransStatus::Failed => CoordinatorStats::incr(&self.stats.failed),
            _ => {}
        }
        self.observer.on_status_changed(trans, from);
        Ok(())
    }

    fn abort(&self, trans: &mut TransGlobal, reason: &str) -> Result<(), StoreError> {
        let from = trans.status;
        trans.protocol.policy().abort(trans, reason, self.now_millis());
        self.persist(trans)?;
        CoordinatorStats::incr(&self.stats.aborted);
        if trans.status != from {
            self.observer.on_status_changed(trans, from);
        } else {
            tracing::info!(gid = %trans.gid, status = %trans.status, reason = %reason, "Rolling back");
        }
        Ok(())
    }

    fn schedule_retry(&self, trans: &mut TransGlobal) -> Result<(), StoreError> {
        trans.retry_count += 1;
        let delay = self.config.retry.delay_for_attempt(trans.retry_count);
        trans.next_cron_time_millis = self.now_millis() + delay.as_millis() as u64;
        tracing::debug!(
            gid = %trans.gid,
            status = %trans.status,
            retry = trans.retry_count,
            next_cron_ms = trans.next_cron_time_millis,
            "Pass ended with work pending"
        );
        self.persist(trans)
    }

    /// Compare-and-swap the record into the store
    pub(crate) fn persist(&self, trans: &mut TransGlobal) -> Result<(), StoreError> {
        trans.updated_at_millis = self.now_millis();
        match self.store.save(trans) {
            Ok(version) => {
                trans.version = version;
                Ok(())
            }
            Err(e @ StoreError::VersionConflict { .. }) => {
                CoordinatorStats::incr(&self.stats.version_conflicts);
                tracing::debug!(gid = %trans.gid, error = %e, "Lost write race, leaving pass");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    // === Workflow entry ===

    pub(crate) async fn execute_workflow(
        &self,
        gid: &str,
        name: &str,
        payload: Vec<u8>,
    ) -> Result<TransGlobal, CoordinatorError> {
        if gid.is_empty() {
            return Err(CoordinatorError::InvalidDefinition("gid must not be empty".into()));
        }
        self.workflow(name)?;
        let policy = Protocol::Workflow.policy();
        let mut trans = TransGlobal::new(
            gid,
            Protocol::Workflow,
            policy.initial_status(),
            Vec::new(),
            payload,
            self.now_millis(),
        );
        trans.workflow_name = Some(name.to_string());

        let trans = self.create(trans)?;
        self.process(trans).await
    }
}
