//! Resumable workflow execution
//!
//! A workflow is a registered function that calls branches through a
//! [`Workflow`] context. Each call is recorded on the transaction as an
//! `action` branch under the next branch id, so when a recovery pass runs the
//! function again from the top, calls that already reached a result are
//! answered from the record instead of being sent again. Phase-2 steps are
//! registered as descriptors, not closures, and survive restarts with the
//! record.

use crate::engine::Engine;
use crate::trans::branch_id;
use crate::{Branch, BranchOp, BranchResult, BranchStatus, StoreError, TransGlobal};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Outcome of a workflow function or of one of its calls
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// Some step is not finished; the function runs again on the next pass
    #[error("workflow ongoing")]
    Ongoing,
    /// A step failed for good; registered rollback steps will run
    #[error("workflow failed: {0}")]
    Failure(String),
    /// The record could not be written
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl WorkflowError {
    /// Create a failure with the given reason
    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Failure(reason.into())
    }
}

/// A branch call the workflow can make or register for phase 2
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDescriptor {
    /// Participant endpoint
    pub target: String,
    /// Request body
    pub payload: Vec<u8>,
}

impl StepDescriptor {
    /// Step calling `target` with a raw body
    pub fn new(target: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            target: target.into(),
            payload,
        }
    }

    /// Step whose body is `body` encoded as JSON
    pub fn json<T: Serialize>(target: impl Into<String>, body: &T) -> Result<Self, WorkflowError> {
        let payload = serde_json::to_vec(body).map_err(|e| WorkflowError::Failure(e.to_string()))?;
        Ok(Self::new(target, payload))
    }
}

/// A registered workflow function.
///
/// The function may run many times for one gid and must reach its branches
/// in the same order on every run.
#[async_trait]
pub trait WorkflowHandler: Send + Sync + 'static {
    /// Run the workflow body once, issuing calls through `wf`
    async fn run(&self, wf: &mut Workflow<'_>, payload: &[u8]) -> Result<(), WorkflowError>;
}

/// Execution context handed to a workflow function for one run
pub struct Workflow<'a> {
    engine: &'a Engine,
    trans: &'a mut TransGlobal,
    issued: usize,
    /// Phase-2 steps registered during this run, as (branch id, op)
    registered: Vec<(String, BranchOp)>,
}

impl<'a> Workflow<'a> {
    pub(crate) fn new(engine: &'a Engine, trans: &'a mut TransGlobal) -> Self {
        Self {
            engine,
            trans,
            issued: 0,
            registered: Vec::new(),
        }
    }

    /// Global transaction id of this workflow
    pub fn gid(&self) -> &str {
        &self.trans.gid
    }

    /// Payload the workflow was executed with
    pub fn payload(&self) -> &[u8] {
        &self.trans.payload
    }

    /// Branch id the next `call` will use
    fn next_branch_id(&self) -> String {
        branch_id(self.issued + 1)
    }

    /// Call a branch, or replay its recorded result
    pub async fn call(&mut self, step: StepDescriptor) -> Result<Vec<u8>, WorkflowError> {
        self.issued += 1;
        let id = branch_id(self.issued);

        let index = match self.trans.find_branch(&id, BranchOp::Action) {
            Some(index) => {
                let branch = &self.trans.branches[index];
                if branch.target != step.target {
                    tracing::error!(
                        gid = %self.trans.gid,
                        branch_id = %id,
                        recorded = %branch.target,
                        requested = %step.target,
                        "Workflow replay reached a different target"
                    );
                    return Err(WorkflowError::Failure(format!(
                        "nondeterministic workflow: branch {id} was {}, now {}",
                        branch.target, step.target
                    )));
                }
                match branch.status {
                    BranchStatus::Succeed => return Ok(branch.result.clone()),
                    BranchStatus::Failed => {
                        return Err(WorkflowError::Failure(branch.error.clone().unwrap_or_default()))
                    }
                    BranchStatus::Prepared => index,
                }
            }
            None => {
                self.trans
                    .branches
                    .push(Branch::new(&id, BranchOp::Action, step.target, step.payload));
                self.trans.branches.len() - 1
            }
        };

        match self.engine.invoke_branch(self.trans, index).await? {
            BranchResult::Success(body) => Ok(body),
            BranchResult::Failure(reason) => Err(WorkflowError::Failure(reason)),
            BranchResult::Ongoing => Err(WorkflowError::Ongoing),
        }
    }

    /// Register the compensation of the next `call`; runs in reverse order
    /// if the workflow fails after that call was attempted.
    ///
    /// Each call takes at most one compensation.
    pub fn define_saga_phase2(&mut self, step: StepDescriptor) -> Result<(), WorkflowError> {
        self.register(BranchOp::Compensate, step)
    }

    /// Register a step to run once the workflow has succeeded
    pub fn on_commit(&mut self, step: StepDescriptor) -> Result<(), WorkflowError> {
        self.register(BranchOp::Commit, step)
    }

    /// Call `action`, committing it with `commit` on success of the whole
    /// workflow or undoing it with `rollback` on failure
    pub async fn do_xa(
        &mut self,
        action: StepDescriptor,
        commit: StepDescriptor,
        rollback: StepDescriptor,
    ) -> Result<Vec<u8>, WorkflowError> {
        self.define_saga_phase2(rollback)?;
        self.on_commit(commit)?;
        self.call(action).await
    }

    fn register(&mut self, op: BranchOp, step: StepDescriptor) -> Result<(), WorkflowError> {
        let id = self.next_branch_id();
        if self.registered.iter().any(|(b, o)| *b == id && *o == op) {
            return Err(WorkflowError::Failure(format!(
                "branch {id} already has a {op} step registered"
            )));
        }
        self.registered.push((id.clone(), op));
        // Registered by an earlier run of the same workflow
        if self.trans.find_branch(&id, op).is_some() {
            return Ok(());
        }
        self.trans
            .branches
            .push(Branch::new(&id, op, step.target, step.payload));
        self.engine.persist(self.trans)?;
        tracing::debug!(gid = %self.trans.gid, branch_id = %id, op = %op, "Phase-2 step registered");
        Ok(())
    }
}
