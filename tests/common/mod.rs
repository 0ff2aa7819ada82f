//! Shared participant stubs for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use dtx_coordinator::{
    BarrierError, BarrierOutcome, BranchBarrier, BranchError, BranchHandler, BranchRequest,
    BranchResult, BarrierStore, Coordinator, CoordinatorConfig, InMemoryLedger, InMemoryTransStore,
    LocalInvoker, LocalTransaction, ManualClock, MemoryTx, NoOpObserver, RecoveryScheduler,
    TransStore,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const START_BALANCE: i64 = 10_000;

/// Body sent to every busi endpoint
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TransReq {
    pub amount: i64,
    #[serde(default)]
    pub trans_out_result: String,
    #[serde(default)]
    pub trans_in_result: String,
}

impl TransReq {
    pub fn new(amount: i64) -> Self {
        Self {
            amount,
            ..Self::default()
        }
    }

    pub fn out_result(mut self, result: &str) -> Self {
        self.trans_out_result = result.to_string();
        self
    }

    pub fn in_result(mut self, result: &str) -> Self {
        self.trans_in_result = result.to_string();
        self
    }

    pub fn body(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap()
    }
}

/// Business state of the busi participant
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Accounts {
    pub out_balance: i64,
    pub in_balance: i64,
    /// Business effects applied, across all endpoints
    pub applied: u32,
    pub confirmed: u32,
}

impl Default for Accounts {
    fn default() -> Self {
        Self {
            out_balance: START_BALANCE,
            in_balance: START_BALANCE,
            applied: 0,
            confirmed: 0,
        }
    }
}

/// One-shot result overrides per target
#[derive(Default)]
pub struct ResultSwitch {
    next: Mutex<HashMap<String, BranchResult>>,
}

impl ResultSwitch {
    /// The next call to `target` answers `result` without touching state
    pub fn set_once(&self, target: &str, result: BranchResult) {
        self.next.lock().unwrap().insert(target.to_string(), result);
    }

    fn take(&self, target: &str) -> Option<BranchResult> {
        self.next.lock().unwrap().remove(target)
    }
}

/// Stages "ongoing" answers across passes: step `i` is ongoing exactly once,
/// and only after steps `0..i` have each been ongoing once.
#[derive(Default)]
pub struct OngoingController {
    current: AtomicUsize,
}

impl OngoingController {
    pub fn ongoing_at(&self, step: usize) -> bool {
        self.current
            .compare_exchange(step, step + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn fetch_step(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Account {
    Out,
    In,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    Forward,
    XaForward,
    Undo,
    Confirm,
}

/// The busi participant: two accounts behind one barrier ledger
#[derive(Default)]
pub struct Busi {
    pub ledger: InMemoryLedger<Accounts>,
    pub switch: ResultSwitch,
    pub ongoing: OngoingController,
    ongoing_steps: Mutex<HashMap<String, usize>>,
    calls: Mutex<HashMap<String, u32>>,
}

impl Busi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serve every busi endpoint on `invoker`
    pub fn mount(self: &Arc<Self>, invoker: &LocalInvoker) {
        let endpoints = [
            ("busi/TransOut", Account::Out, Kind::Forward),
            ("busi/TransOutRevert", Account::Out, Kind::Undo),
            ("busi/TransIn", Account::In, Kind::Forward),
            ("busi/TransInRevert", Account::In, Kind::Undo),
            ("busi/TransOutTry", Account::Out, Kind::Forward),
            ("busi/TransOutConfirm", Account::Out, Kind::Confirm),
            ("busi/TransOutCancel", Account::Out, Kind::Undo),
            ("busi/TransInTry", Account::In, Kind::Forward),
            ("busi/TransInConfirm", Account::In, Kind::Confirm),
            ("busi/TransInCancel", Account::In, Kind::Undo),
            ("busi/TransOutXa", Account::Out, Kind::XaForward),
            ("busi/TransOutXaCommit", Account::Out, Kind::Confirm),
            ("busi/TransOutXaRollback", Account::Out, Kind::Undo),
            ("busi/TransInXa", Account::In, Kind::XaForward),
            ("busi/TransInXaCommit", Account::In, Kind::Confirm),
            ("busi/TransInXaRollback", Account::In, Kind::Undo),
        ];
        for (target, account, kind) in endpoints {
            invoker.route(
                target,
                Arc::new(Endpoint {
                    busi: self.clone(),
                    target: target.to_string(),
                    account,
                    kind,
                }),
            );
        }
    }

    /// Make `target` answer ongoing when the controller reaches `step`
    pub fn ongoing_on(&self, target: &str, step: usize) {
        self.ongoing_steps.lock().unwrap().insert(target.to_string(), step);
    }

    pub fn accounts(&self) -> Accounts {
        self.ledger.snapshot().unwrap()
    }

    /// Calls received by `target`, including short-circuited ones
    pub fn calls(&self, target: &str) -> u32 {
        self.calls.lock().unwrap().get(target).copied().unwrap_or(0)
    }

    fn ongoing_now(&self, target: &str) -> bool {
        let step = self.ongoing_steps.lock().unwrap().get(target).copied();
        step.map(|s| self.ongoing.ongoing_at(s)).unwrap_or(false)
    }
}

fn apply(tx: &mut MemoryTx<'_, Accounts>, account: Account, kind: Kind, amount: i64) -> Result<(), BranchError> {
    let data = tx.data_mut();
    match (account, kind) {
        (_, Kind::Confirm) => data.confirmed += 1,
        (Account::Out, Kind::Forward | Kind::XaForward) => {
            if data.out_balance < amount {
                return Err(BranchError::failure("insufficient balance"));
            }
            data.out_balance -= amount;
        }
        (Account::Out, Kind::Undo) => data.out_balance += amount,
        (Account::In, Kind::Forward | Kind::XaForward) => data.in_balance += amount,
        (Account::In, Kind::Undo) => data.in_balance -= amount,
    }
    data.applied += 1;
    Ok(())
}

struct Endpoint {
    busi: Arc<Busi>,
    target: String,
    account: Account,
    kind: Kind,
}

impl Endpoint {
    fn forward_result(&self, req: &TransReq) -> String {
        match self.account {
            Account::Out => req.trans_out_result.clone(),
            Account::In => req.trans_in_result.clone(),
        }
    }

    /// XA forward: the prepared marker and the effect in one local transaction
    fn xa_forward(&self, request: &BranchRequest, amount: i64, fail: bool) -> BranchResult {
        let mut barrier = BranchBarrier::from_request(request);
        let account = self.account;
        let result = (|| -> Result<BarrierOutcome, BarrierError<BranchError>> {
            let mut tx = self.busi.ledger.begin()?;
            let prepared = barrier.prepare(&mut tx, |_| Ok::<(), BranchError>(()))?;
            if prepared == BarrierOutcome::Suspended {
                return Ok(prepared);
            }
            let outcome = barrier.call(&mut tx, |tx| {
                if fail {
                    return Err(BranchError::failure("FAILURE"));
                }
                apply(tx, account, Kind::XaForward, amount)
            })?;
            tx.commit()?;
            Ok(outcome)
        })();
        result.into()
    }
}

#[async_trait]
impl BranchHandler for Endpoint {
    async fn handle(&self, request: &BranchRequest) -> BranchResult {
        *self.busi.calls.lock().unwrap().entry(self.target.clone()).or_default() += 1;

        if let Some(result) = self.busi.switch.take(&self.target) {
            return result;
        }
        if self.busi.ongoing_now(&self.target) {
            return BranchResult::Ongoing;
        }
        let req: TransReq = match serde_json::from_slice(&request.payload) {
            Ok(req) => req,
            Err(e) => return BranchResult::Failure(e.to_string()),
        };

        let mut fail = false;
        if matches!(self.kind, Kind::Forward | Kind::XaForward) {
            match self.forward_result(&req).as_str() {
                "ONGOING" => return BranchResult::Ongoing,
                "FAILURE" => fail = true,
                _ => {}
            }
        }
        if self.kind == Kind::XaForward {
            return self.xa_forward(request, req.amount, fail);
        }

        let (account, kind) = (self.account, self.kind);
        BranchBarrier::from_request(request)
            .call_with_store(&self.busi.ledger, |tx| {
                if fail {
                    return Err(BranchError::failure("FAILURE"));
                }
                apply(tx, account, kind, req.amount)
            })
            .into()
    }
}

/// Coordinator wired to a busi participant on a manual clock
pub struct Harness {
    pub coordinator: Coordinator,
    pub busi: Arc<Busi>,
    pub invoker: Arc<LocalInvoker>,
    pub store: Arc<InMemoryTransStore>,
    pub clock: Arc<ManualClock>,
    pub scheduler: RecoveryScheduler,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(CoordinatorConfig::default())
    }

    pub fn with_config(config: CoordinatorConfig) -> Self {
        let busi = Busi::new();
        let invoker = Arc::new(LocalInvoker::new());
        busi.mount(&invoker);
        let store = Arc::new(InMemoryTransStore::new());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let coordinator = Coordinator::builder(config, store.clone(), invoker.clone())
            .clock(clock.clone())
            .observer(Arc::new(NoOpObserver))
            .build()
            .unwrap();
        let scheduler = coordinator.scheduler();
        Self {
            coordinator,
            busi,
            invoker,
            store,
            clock,
            scheduler,
        }
    }

    /// Move past any scheduled retry or lease and run one recovery sweep
    pub async fn cron(&self) -> usize {
        self.clock.advance(Duration::from_secs(3_600));
        self.scheduler.run_once().await.unwrap()
    }

    pub fn status(&self, gid: &str) -> dtx_coordinator::TransStatus {
        self.store.load(gid).unwrap().unwrap().status
    }

    pub fn branch_statuses(&self, gid: &str) -> Vec<dtx_coordinator::BranchStatus> {
        self.coordinator.query_status(gid).unwrap().branch_statuses()
    }
}

/// Install a test subscriber; `RUST_LOG` controls verbosity
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
