mod common;

use async_trait::async_trait;
use common::{Busi, Harness, TransReq, START_BALANCE};
use dtx_coordinator::{
    BranchOp, BranchResult, BranchStatus, CoordinatorConfig, CoordinatorError, StepDescriptor,
    TransStatus, Workflow, WorkflowError, WorkflowHandler,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// TransOut then TransIn, each with a registered compensation.
///
/// With `staged` set, the function reports ongoing at controller steps 0, 1
/// and 2, one per run.
struct TransferFlow {
    busi: Arc<Busi>,
    staged: bool,
}

impl TransferFlow {
    fn ongoing_at(&self, step: usize) -> bool {
        self.staged && self.busi.ongoing.ongoing_at(step)
    }
}

#[async_trait]
impl WorkflowHandler for TransferFlow {
    async fn run(&self, wf: &mut Workflow<'_>, payload: &[u8]) -> Result<(), WorkflowError> {
        if self.ongoing_at(0) {
            return Err(WorkflowError::Ongoing);
        }
        wf.define_saga_phase2(StepDescriptor::new("busi/TransOutRevert", payload.to_vec()))?;
        wf.call(StepDescriptor::new("busi/TransOut", payload.to_vec())).await?;
        if self.ongoing_at(1) {
            return Err(WorkflowError::Ongoing);
        }
        wf.define_saga_phase2(StepDescriptor::new("busi/TransInRevert", payload.to_vec()))?;
        if self.ongoing_at(2) {
            return Err(WorkflowError::Ongoing);
        }
        wf.call(StepDescriptor::new("busi/TransIn", payload.to_vec())).await?;
        Ok(())
    }
}

/// XA-style transfer: each action is committed or rolled back in phase 2
struct XaFlow;

#[async_trait]
impl WorkflowHandler for XaFlow {
    async fn run(&self, wf: &mut Workflow<'_>, payload: &[u8]) -> Result<(), WorkflowError> {
        wf.do_xa(
            StepDescriptor::new("busi/TransOutXa", payload.to_vec()),
            StepDescriptor::new("busi/TransOutXaCommit", payload.to_vec()),
            StepDescriptor::new("busi/TransOutXaRollback", payload.to_vec()),
        )
        .await?;
        wf.do_xa(
            StepDescriptor::new("busi/TransInXa", payload.to_vec()),
            StepDescriptor::new("busi/TransInXaCommit", payload.to_vec()),
            StepDescriptor::new("busi/TransInXaRollback", payload.to_vec()),
        )
        .await?;
        Ok(())
    }
}

/// Credits one unit per step, deferring once before each step
struct Installments {
    steps: usize,
    deferred: Mutex<HashSet<usize>>,
}

#[async_trait]
impl WorkflowHandler for Installments {
    async fn run(&self, wf: &mut Workflow<'_>, _payload: &[u8]) -> Result<(), WorkflowError> {
        for step in 0..self.steps {
            if self.deferred.lock().unwrap().insert(step) {
                return Err(WorkflowError::Ongoing);
            }
            wf.call(StepDescriptor::new("busi/TransIn", TransReq::new(1).body())).await?;
        }
        Ok(())
    }
}

fn register_transfer(h: &Harness, staged: bool) {
    h.coordinator.register_workflow(
        "transfer",
        Arc::new(TransferFlow {
            busi: h.busi.clone(),
            staged,
        }),
    );
}

#[tokio::test]
async fn test_workflow_normal() {
    let h = Harness::new();
    register_transfer(&h, false);

    h.coordinator
        .execute_workflow("wf-normal", "transfer", TransReq::new(30).body())
        .await
        .unwrap();

    let trans = h.coordinator.query_status("wf-normal").unwrap();
    assert_eq!(trans.status, TransStatus::Succeed);
    let ops: Vec<_> = trans.branches.iter().map(|b| (b.branch_id.as_str(), b.op)).collect();
    assert_eq!(
        ops,
        vec![
            ("01", BranchOp::Compensate),
            ("01", BranchOp::Action),
            ("02", BranchOp::Compensate),
            ("02", BranchOp::Action),
        ]
    );
    assert_eq!(h.busi.accounts().in_balance, START_BALANCE + 30);
}

#[tokio::test]
async fn test_workflow_rollback() {
    let h = Harness::new();
    register_transfer(&h, false);

    let err = h
        .coordinator
        .execute_workflow("wf-rollback", "transfer", TransReq::new(30).in_result("FAILURE").body())
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::Failure(ref reason) if reason == "FAILURE"));

    let trans = h.coordinator.query_status("wf-rollback").unwrap();
    assert_eq!(trans.status, TransStatus::Failed);
    assert_eq!(trans.rollback_reason.as_deref(), Some("FAILURE"));
    let accounts = h.busi.accounts();
    assert_eq!(accounts.out_balance, START_BALANCE);
    assert_eq!(accounts.in_balance, START_BALANCE);
}

#[tokio::test]
async fn test_workflow_resumed_across_six_passes() {
    let h = Harness::new();
    register_transfer(&h, true);
    h.busi.ongoing_on("busi/TransInRevert", 3);
    h.busi.ongoing_on("busi/TransOutRevert", 4);

    let err = h
        .coordinator
        .execute_workflow("wf-ongoing", "transfer", TransReq::new(30).in_result("FAILURE").body())
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::Ongoing));
    assert_eq!(h.status("wf-ongoing"), TransStatus::Prepared);

    for pass in 1..=4 {
        assert_eq!(h.cron().await, 1, "cron pass {pass}");
        assert_eq!(h.status("wf-ongoing"), TransStatus::Prepared, "cron pass {pass}");
        assert_eq!(h.busi.ongoing.fetch_step(), pass + 1);
    }

    h.cron().await;
    let trans = h.coordinator.query_status("wf-ongoing").unwrap();
    assert_eq!(trans.status, TransStatus::Failed);

    // Each participant call went out exactly as often as an uninterrupted run needs
    assert_eq!(h.busi.calls("busi/TransOut"), 1);
    assert_eq!(h.busi.calls("busi/TransIn"), 1);
    assert_eq!(h.busi.calls("busi/TransInRevert"), 2);
    assert_eq!(h.busi.calls("busi/TransOutRevert"), 2);
    let accounts = h.busi.accounts();
    assert_eq!(accounts.out_balance, START_BALANCE);
    assert_eq!(accounts.in_balance, START_BALANCE);
}

#[tokio::test]
async fn test_workflow_commit_hooks() {
    let h = Harness::new();
    h.coordinator.register_workflow("xa-transfer", Arc::new(XaFlow));
    h.busi.switch.set_once("busi/TransInXaCommit", BranchResult::Ongoing);

    h.coordinator
        .execute_workflow("wf-xa", "xa-transfer", TransReq::new(30).body())
        .await
        .unwrap();
    assert_eq!(h.status("wf-xa"), TransStatus::Submitted);

    h.cron().await;
    let trans = h.coordinator.query_status("wf-xa").unwrap();
    assert_eq!(trans.status, TransStatus::Succeed);
    let commits: Vec<_> = trans
        .branches
        .iter()
        .filter(|b| b.op == BranchOp::Commit)
        .map(|b| b.status)
        .collect();
    assert_eq!(commits, vec![BranchStatus::Succeed, BranchStatus::Succeed]);
    assert_eq!(h.busi.accounts().confirmed, 2);
}

#[tokio::test]
async fn test_workflow_xa_rollback_skips_commits() {
    let h = Harness::new();
    h.coordinator.register_workflow("xa-transfer", Arc::new(XaFlow));

    let err = h
        .coordinator
        .execute_workflow("wf-xa-fail", "xa-transfer", TransReq::new(30).in_result("FAILURE").body())
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::Failure(_)));
    assert_eq!(h.status("wf-xa-fail"), TransStatus::Failed);
    assert_eq!(h.busi.calls("busi/TransOutXaCommit"), 0);
    assert_eq!(h.busi.accounts().out_balance, START_BALANCE);
}

#[tokio::test]
async fn test_unknown_workflow() {
    let h = Harness::new();
    assert!(matches!(
        h.coordinator.execute_workflow("wf-none", "missing", vec![]).await,
        Err(CoordinatorError::UnknownWorkflow(_))
    ));
    assert!(h.coordinator.query_status("wf-none").is_err());
}

#[tokio::test]
async fn test_long_workflow_deferring_every_step_completes() {
    let h = Harness::new();
    let steps = CoordinatorConfig::default().retry.max_attempts as usize + 2;
    h.coordinator.register_workflow(
        "installments",
        Arc::new(Installments {
            steps,
            deferred: Mutex::new(HashSet::new()),
        }),
    );

    let err = h
        .coordinator
        .execute_workflow("wf-installments", "installments", vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::Ongoing));

    for pass in 1..=steps {
        assert_eq!(h.cron().await, 1, "cron pass {pass}");
    }

    let trans = h.coordinator.query_status("wf-installments").unwrap();
    assert_eq!(trans.status, TransStatus::Succeed);
    assert_eq!(trans.rollback_reason, None);
    assert_eq!(trans.branches.len(), steps);
    assert_eq!(h.busi.calls("busi/TransIn"), steps as u32);
    assert_eq!(h.busi.accounts().in_balance, START_BALANCE + steps as i64);
}
