//! Protocol drivers
//!
//! Each protocol is a stateless policy over a [`TransGlobal`]: it lays out
//! the branch plan at submission, and on every dispatch step it reads the
//! persisted record and says what the engine should do next. Because the
//! decision is a pure function of the record, a pass resumed after a crash
//! picks up exactly where the last persisted write left off.

use crate::trans::branch_id;
use crate::{Branch, BranchOp, BranchStatus, CoordinatorError, Protocol, TransGlobal, TransStatus};

/// Next thing the dispatch engine should do for a transaction
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DriverStep {
    /// Call the branch at this index
    Invoke(usize),
    /// Persist a status change
    Transition(TransStatus),
    /// Run the registered workflow function
    RunWorkflow,
}

/// Capability set every protocol provides to the dispatch engine
pub trait ProtocolPolicy: Send + Sync + 'static {
    /// Status a freshly submitted record is persisted with
    fn initial_status(&self) -> TransStatus;

    /// Expand a definition into the ordered branch plan
    fn plan_branches(&self, steps: &[StepPlan]) -> Result<Vec<Branch>, CoordinatorError>;

    /// Decide the next step from the persisted record
    fn next_step(&self, trans: &TransGlobal) -> DriverStep;

    /// Whether the record is still in its bounded-retry forward phase
    fn in_forward_phase(&self, trans: &TransGlobal) -> bool;

    /// Enter the abort path
    fn abort(&self, trans: &mut TransGlobal, reason: &str, now_millis: u64) {
        trans.rollback_reason = Some(reason.to_string());
        trans.change_status(TransStatus::Aborting, now_millis);
    }
}

impl Protocol {
    /// Policy driving this protocol
    pub fn policy(&self) -> &'static dyn ProtocolPolicy {
        match self {
            Protocol::Saga => &SagaPolicy,
            Protocol::Tcc => &TCC_POLICY,
            Protocol::Xa => &XA_POLICY,
            Protocol::Workflow => &WorkflowPolicy,
        }
    }
}

/// First pending branch with op `op`, in plan order
fn first_pending(trans: &TransGlobal, op: BranchOp) -> Option<usize> {
    trans
        .branches
        .iter()
        .position(|b| b.op == op && b.status == BranchStatus::Prepared)
}

fn all_succeeded(trans: &TransGlobal, op: BranchOp) -> bool {
    trans
        .branches
        .iter()
        .filter(|b| b.op == op)
        .all(|b| b.status == BranchStatus::Succeed)
}

/// Last pending undo branch in plan order, optionally only those whose
/// forward op was attempted
fn last_pending_undo(trans: &TransGlobal, op: BranchOp, attempted_only: bool) -> Option<usize> {
    trans.branches.iter().rposition(|b| {
        b.op == op
            && b.status == BranchStatus::Prepared
            && (!attempted_only || trans.origin_attempted(b))
    })
}

/// Saga: actions in order, compensations of attempted actions in reverse.
///
/// Branch layout per step: `[compensate, action]`.
pub struct SagaPolicy;

impl ProtocolPolicy for SagaPolicy {
    fn initial_status(&self) -> TransStatus {
        TransStatus::Submitted
    }

    fn plan_branches(&self, steps: &[StepPlan]) -> Result<Vec<Branch>, CoordinatorError> {
        let mut branches = Vec::with_capacity(steps.len() * 2);
        for (i, step) in steps.iter().enumerate() {
            let id = branch_id(i + 1);
            branches.push(Branch::new(&id, BranchOp::Compensate, &step.undo, step.payload.clone()));
            branches.push(Branch::new(&id, BranchOp::Action, &step.forward, step.payload.clone()));
        }
        Ok(branches)
    }

    fn next_step(&self, trans: &TransGlobal) -> DriverStep {
        match trans.status {
            TransStatus::Submitted | TransStatus::Prepared => match first_pending(trans, BranchOp::Action) {
                Some(i) => DriverStep::Invoke(i),
                None if all_succeeded(trans, BranchOp::Action) => DriverStep::Transition(TransStatus::Succeed),
                None => DriverStep::Transition(TransStatus::Aborting),
            },
            TransStatus::Aborting => match last_pending_undo(trans, BranchOp::Compensate, true) {
                Some(i) => DriverStep::Invoke(i),
                None => DriverStep::Transition(TransStatus::Failed),
            },
            TransStatus::Succeed | TransStatus::Failed => DriverStep::Transition(trans.status),
        }
    }

    fn in_forward_phase(&self, trans: &TransGlobal) -> bool {
        matches!(trans.status, TransStatus::Submitted | TransStatus::Prepared)
    }
}

/// Two-phase protocols: every forward op in order, then the commit op on
/// each branch; on a forward failure the undo op in reverse.
///
/// Branch layout per step: `[forward, commit, undo]`.
pub struct TwoPhasePolicy {
    forward: BranchOp,
    commit: BranchOp,
    undo: BranchOp,
    /// Undo branches whose forward op was never called (TCC cancels them too,
    /// leaving the participant's barrier to turn them into null compensations)
    undo_untried: bool,
}

/// Try / confirm / cancel
pub const TCC_POLICY: TwoPhasePolicy = TwoPhasePolicy {
    forward: BranchOp::Try,
    commit: BranchOp::Confirm,
    undo: BranchOp::Cancel,
    undo_untried: true,
};

/// Action / commit / rollback; only attempted actions are rolled back
pub const XA_POLICY: TwoPhasePolicy = TwoPhasePolicy {
    forward: BranchOp::Action,
    commit: BranchOp::Commit,
    undo: BranchOp::Rollback,
    undo_untried: false,
};

impl ProtocolPolicy for TwoPhasePolicy {
    fn initial_status(&self) -> TransStatus {
        TransStatus::Prepared
    }

    fn plan_branches(&self, steps: &[StepPlan]) -> Result<Vec<Branch>, CoordinatorError> {
        let mut branches = Vec::with_capacity(steps.len() * 3);
        for (i, step) in steps.iter().enumerate() {
            let commit = step.commit.as_ref().ok_or_else(|| {
                CoordinatorError::InvalidDefinition(format!("step {} has no {} target", i + 1, self.commit))
            })?;
            let id = branch_id(i + 1);
            branches.push(Branch::new(&id, self.forward, &step.forward, step.payload.clone()));
            branches.push(Branch::new(&id, self.commit, commit, step.payload.clone()));
            branches.push(Branch::new(&id, self.undo, &step.undo, step.payload.clone()));
        }
        Ok(branches)
    }

    fn next_step(&self, trans: &TransGlobal) -> DriverStep {
        match trans.status {
            TransStatus::Prepared => match first_pending(trans, self.forward) {
                Some(i) => DriverStep::Invoke(i),
                None if all_succeeded(trans, self.forward) => DriverStep::Transition(TransStatus::Submitted),
                None => DriverStep::Transition(TransStatus::Aborting),
            },
            TransStatus::Submitted => match first_pending(trans, self.commit) {
                Some(i) => DriverStep::Invoke(i),
                None => DriverStep::Transition(TransStatus::Succeed),
            },
            TransStatus::Aborting => match last_pending_undo(trans, self.undo, !self.undo_untried) {
                Some(i) => DriverStep::Invoke(i),
                None => DriverStep::Transition(TransStatus::Failed),
            },
            TransStatus::Succeed | TransStatus::Failed => DriverStep::Transition(trans.status),
        }
    }

    fn in_forward_phase(&self, trans: &TransGlobal) -> bool {
        trans.status == TransStatus::Prepared
    }
}

/// Workflow: the registered function runs the forward phase; afterwards
/// the phase-2 branches it registered run from their persisted descriptors.
///
/// While rolling back the record stays `prepared` with `rollback_reason`
/// set; on success it moves to `submitted` for the commit hooks.
pub struct WorkflowPolicy;

impl ProtocolPolicy for WorkflowPolicy {
    fn initial_status(&self) -> TransStatus {
        TransStatus::Prepared
    }

    fn plan_branches(&self, steps: &[StepPlan]) -> Result<Vec<Branch>, CoordinatorError> {
        if !steps.is_empty() {
            return Err(CoordinatorError::InvalidDefinition(
                "workflow branches are registered by the workflow function".into(),
            ));
        }
        Ok(Vec::new())
    }

    fn next_step(&self, trans: &TransGlobal) -> DriverStep {
        match trans.status {
            TransStatus::Prepared if trans.rollback_reason.is_none() => DriverStep::RunWorkflow,
            TransStatus::Prepared | TransStatus::Aborting => {
                match last_pending_undo(trans, BranchOp::Compensate, true) {
                    Some(i) => DriverStep::Invoke(i),
                    None => DriverStep::Transition(TransStatus::Failed),
                }
            }
            TransStatus::Submitted => match first_pending(trans, BranchOp::Commit) {
                Some(i) => DriverStep::Invoke(i),
                None => DriverStep::Transition(TransStatus::Succeed),
            },
            TransStatus::Succeed | TransStatus::Failed => DriverStep::Transition(trans.status),
        }
    }

    fn in_forward_phase(&self, trans: &TransGlobal) -> bool {
        trans.status == TransStatus::Prepared && trans.rollback_reason.is_none()
    }

    fn abort(&self, trans: &mut TransGlobal, reason: &str, now_millis: u64) {
        trans.rollback_reason = Some(reason.to_string());
        trans.retry_count = 0;
        trans.next_cron_time_millis = now_millis;
    }
}

/// One step of a branch plan
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepPlan {
    /// Action / try target
    pub forward: String,
    /// Confirm / commit target (two-phase protocols)
    pub commit: Option<String>,
    /// Compensate / cancel / rollback target
    pub undo: String,
    /// Request body for every op of the step
    pub payload: Vec<u8>,
}

/// A transaction as submitted by a caller
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransDefinition {
    /// Caller-chosen unique id
    pub gid: String,
    /// Protocol that drives the steps
    pub protocol: Protocol,
    /// Steps in forward order
    pub steps: Vec<StepPlan>,
    /// Transaction-level payload, kept on the record
    pub payload: Vec<u8>,
}

impl TransDefinition {
    /// Start a saga definition
    pub fn saga(gid: impl Into<String>) -> Self {
        Self::new(gid, Protocol::Saga)
    }

    /// Start a TCC definition
    pub fn tcc(gid: impl Into<String>) -> Self {
        Self::new(gid, Protocol::Tcc)
    }

    /// Start an XA definition
    pub fn xa(gid: impl Into<String>) -> Self {
        Self::new(gid, Protocol::Xa)
    }

    fn new(gid: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            gid: gid.into(),
            protocol,
            steps: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Saga step: action and its compensation
    pub fn add(mut self, action: impl Into<String>, compensate: impl Into<String>, payload: Vec<u8>) -> Self {
        self.steps.push(StepPlan {
            forward: action.into(),
            commit: None,
            undo: compensate.into(),
            payload,
        });
        self
    }

    /// Two-phase step: try/action, confirm/commit and cancel/rollback
    pub fn add_two_phase(
        mut self,
        forward: impl Into<String>,
        commit: impl Into<String>,
        undo: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        self.steps.push(StepPlan {
            forward: forward.into(),
            commit: Some(commit.into()),
            undo: undo.into(),
            payload,
        });
        self
    }

    /// Opaque data stored with the transaction
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Build the record to persist
    pub fn into_trans(self, now_millis: u64) -> Result<TransGlobal, CoordinatorError> {
        if self.gid.is_empty() {
            return Err(CoordinatorError::InvalidDefinition("gid must not be empty".into()));
        }
        let policy = self.protocol.policy();
        if self.steps.is_empty() && self.protocol != Protocol::Workflow {
            return Err(CoordinatorError::InvalidDefinition(format!(
                "{} transaction {} has no branches",
                self.protocol, self.gid
            )));
        }
        let branches = policy.plan_branches(&self.steps)?;
        Ok(TransGlobal::new(
            self.gid,
            self.protocol,
            policy.initial_status(),
            branches,
            self.payload,
            now_millis,
        ))
    }
}
