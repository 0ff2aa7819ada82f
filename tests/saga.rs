mod common;

use common::{Harness, TransReq, START_BALANCE};
use dtx_coordinator::{
    BranchOp, BranchRequest, BranchResult, BranchStatus, BranchInvoker, CoordinatorError, Protocol,
    TransDefinition, TransStatus,
};

use BranchStatus::{Failed, Prepared, Succeed};

fn saga(gid: &str, req: &TransReq) -> TransDefinition {
    TransDefinition::saga(gid)
        .add("busi/TransOut", "busi/TransOutRevert", req.body())
        .add("busi/TransIn", "busi/TransInRevert", req.body())
}

#[tokio::test]
async fn test_saga_normal() {
    common::init_tracing();
    let h = Harness::new();

    let status = h.coordinator.submit_and_wait(saga("saga-normal", &TransReq::new(30))).await.unwrap();

    assert_eq!(status, TransStatus::Succeed);
    assert_eq!(h.branch_statuses("saga-normal"), vec![Prepared, Succeed, Prepared, Succeed]);
    let accounts = h.busi.accounts();
    assert_eq!(accounts.out_balance, START_BALANCE - 30);
    assert_eq!(accounts.in_balance, START_BALANCE + 30);
}

#[tokio::test]
async fn test_saga_forward_pending_then_committed() {
    let h = Harness::new();
    h.busi.switch.set_once("busi/TransIn", BranchResult::Ongoing);

    let status = h.coordinator.submit_and_wait(saga("saga-pending", &TransReq::new(30))).await.unwrap();
    assert_eq!(status, TransStatus::Submitted);
    assert_eq!(h.branch_statuses("saga-pending"), vec![Prepared, Succeed, Prepared, Prepared]);

    assert_eq!(h.cron().await, 1);
    assert_eq!(h.status("saga-pending"), TransStatus::Succeed);
    assert_eq!(h.busi.calls("busi/TransIn"), 2);
    assert_eq!(h.busi.calls("busi/TransOut"), 1);
}

#[tokio::test]
async fn test_saga_rollback_with_pending_compensation() {
    let h = Harness::new();
    h.busi.switch.set_once("busi/TransOutRevert", BranchResult::Ongoing);

    let req = TransReq::new(30).in_result("FAILURE");
    let status = h.coordinator.submit_and_wait(saga("saga-rollback", &req)).await.unwrap();

    assert_eq!(status, TransStatus::Aborting);
    assert_eq!(h.branch_statuses("saga-rollback"), vec![Prepared, Succeed, Succeed, Failed]);

    h.cron().await;
    let trans = h.coordinator.query_status("saga-rollback").unwrap();
    assert_eq!(trans.status, TransStatus::Failed);
    assert_eq!(trans.branch_statuses(), vec![Succeed, Succeed, Succeed, Failed]);
    assert_eq!(trans.rollback_reason.as_deref(), Some("FAILURE"));

    // TransIn never applied, so its revert was a null compensation
    let accounts = h.busi.accounts();
    assert_eq!(accounts.out_balance, START_BALANCE);
    assert_eq!(accounts.in_balance, START_BALANCE);
    assert_eq!(accounts.applied, 2);
}

#[tokio::test]
async fn test_saga_first_action_failure_compensates_only_attempted() {
    let h = Harness::new();

    let status = h
        .coordinator
        .submit_and_wait(saga("saga-broke", &TransReq::new(START_BALANCE + 1)))
        .await
        .unwrap();

    assert_eq!(status, TransStatus::Failed);
    assert_eq!(h.branch_statuses("saga-broke"), vec![Succeed, Failed, Prepared, Prepared]);
    assert_eq!(h.busi.calls("busi/TransIn"), 0);
    assert_eq!(h.busi.calls("busi/TransInRevert"), 0);
    assert_eq!(h.busi.accounts().applied, 0);
}

#[tokio::test]
async fn test_saga_redelivered_action_applies_once() {
    let h = Harness::new();
    h.coordinator.submit_and_wait(saga("saga-redeliver", &TransReq::new(30))).await.unwrap();

    // A retry of an already-applied action, e.g. after a lost response
    let request = BranchRequest {
        protocol: Protocol::Saga,
        gid: "saga-redeliver".into(),
        branch_id: "01".into(),
        op: BranchOp::Action,
        target: "busi/TransOut".into(),
        payload: TransReq::new(30).body(),
    };
    for _ in 0..3 {
        let result = h.invoker.invoke(&request).await.unwrap();
        assert_eq!(result, BranchResult::Success(vec![]));
    }
    assert_eq!(h.busi.accounts().out_balance, START_BALANCE - 30);
}

#[tokio::test]
async fn test_saga_resubmission() {
    let h = Harness::new();
    let req = TransReq::new(30);
    assert_eq!(
        h.coordinator.submit_and_wait(saga("saga-again", &req)).await.unwrap(),
        TransStatus::Succeed
    );
    assert_eq!(
        h.coordinator.submit_and_wait(saga("saga-again", &req)).await.unwrap(),
        TransStatus::Succeed
    );
    assert_eq!(h.busi.calls("busi/TransOut"), 1);

    let tcc = TransDefinition::tcc("saga-again").add_two_phase(
        "busi/TransOutTry",
        "busi/TransOutConfirm",
        "busi/TransOutCancel",
        req.body(),
    );
    assert!(matches!(
        h.coordinator.submit_and_wait(tcc).await,
        Err(CoordinatorError::Conflict(_))
    ));
}

#[tokio::test]
async fn test_saga_background_submit() {
    let h = Harness::new();
    let gid = h.coordinator.submit(saga("saga-async", &TransReq::new(30))).await.unwrap();
    assert_eq!(gid, "saga-async");

    for _ in 0..100 {
        if h.status(&gid).is_terminal() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(h.status(&gid), TransStatus::Succeed);
    assert_eq!(h.coordinator.stats().succeeded, 1);
}

#[tokio::test]
async fn test_empty_saga_is_rejected() {
    let h = Harness::new();
    assert!(matches!(
        h.coordinator.submit_and_wait(TransDefinition::saga("saga-empty")).await,
        Err(CoordinatorError::InvalidDefinition(_))
    ));
    assert!(h.coordinator.query_status("saga-empty").is_err());
}
