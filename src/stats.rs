//! Coordinator statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Coordinator-wide counters
pub struct CoordinatorStats {
    /// Transactions accepted
    pub submitted: AtomicU64,
    /// Dispatch passes run
    pub passes: AtomicU64,
    /// Branch calls sent
    pub branch_calls: AtomicU64,
    /// Calls answered with success
    pub branch_successes: AtomicU64,
    /// Calls answered with failure
    pub branch_failures: AtomicU64,
    /// Calls that ended ongoing, timed out or could not be delivered
    pub branch_pending: AtomicU64,
    /// Rollbacks started
    pub aborted: AtomicU64,
    /// Transactions that reached `succeed`
    pub succeeded: AtomicU64,
    /// Transactions that reached `failed`
    pub failed: AtomicU64,
    /// Forward phases aborted for running out of retries
    pub retries_exhausted: AtomicU64,
    /// Writes lost to a concurrent pass
    pub version_conflicts: AtomicU64,
}

impl CoordinatorStats {
    /// All counters at zero
    pub fn new() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            passes: AtomicU64::new(0),
            branch_calls: AtomicU64::new(0),
            branch_successes: AtomicU64::new(0),
            branch_failures: AtomicU64::new(0),
            branch_pending: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retries_exhausted: AtomicU64::new(0),
            version_conflicts: AtomicU64::new(0),
        }
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> CoordinatorStatsSnapshot {
        CoordinatorStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            passes: self.passes.load(Ordering::Relaxed),
            branch_calls: self.branch_calls.load(Ordering::Relaxed),
            branch_successes: self.branch_successes.load(Ordering::Relaxed),
            branch_failures: self.branch_failures.load(Ordering::Relaxed),
            branch_pending: self.branch_pending.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retries_exhausted: self.retries_exhausted.load(Ordering::Relaxed),
            version_conflicts: self.version_conflicts.load(Ordering::Relaxed),
        }
    }
}

impl Default for CoordinatorStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Plain copy of [`CoordinatorStats`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CoordinatorStatsSnapshot {
    /// Transactions accepted
    pub submitted: u64,
    /// Dispatch passes run
    pub passes: u64,
    /// Branch calls sent
    pub branch_calls: u64,
    /// Calls answered with success
    pub branch_successes: u64,
    /// Calls answered with failure
    pub branch_failures: u64,
    /// Calls that ended ongoing, timed out or could not be delivered
    pub branch_pending: u64,
    /// Rollbacks started
    pub aborted: u64,
    /// Transactions that reached `succeed`
    pub succeeded: u64,
    /// Transactions that reached `failed`
    pub failed: u64,
    /// Forward phases aborted for running out of retries
    pub retries_exhausted: u64,
    /// Writes lost to a concurrent pass
    pub version_conflicts: u64,
}
