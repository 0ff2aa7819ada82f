//! Transaction observer trait

use crate::{Branch, TransGlobal, TransStatus};

/// Observer trait for external observability
pub trait TransObserver: Send + Sync + 'static {
    /// A new record was stored
    fn on_submitted(&self, trans: &TransGlobal);
    /// A branch call succeeded
    fn on_branch_succeeded(&self, trans: &TransGlobal, branch: &Branch);
    /// A branch call was rejected
    fn on_branch_failed(&self, trans: &TransGlobal, branch: &Branch, reason: &str);
    /// A branch call ended without a result and will be retried
    fn on_branch_pending(&self, trans: &TransGlobal, branch: &Branch, reason: &str);
    /// The transaction moved from `from` to its current status
    fn on_status_changed(&self, trans: &TransGlobal, from: TransStatus);
    /// The forward phase ran out of retries
    fn on_retry_exhausted(&self, trans: &TransGlobal);
}

/// No-op observer
pub struct NoOpObserver;

impl TransObserver for NoOpObserver {
    fn on_submitted(&self, _trans: &TransGlobal) {}
    fn on_branch_succeeded(&self, _trans: &TransGlobal, _branch: &Branch) {}
    fn on_branch_failed(&self, _trans: &TransGlobal, _branch: &Branch, _reason: &str) {}
    fn on_branch_pending(&self, _trans: &TransGlobal, _branch: &Branch, _reason: &str) {}
    fn on_status_changed(&self, _trans: &TransGlobal, _from: TransStatus) {}
    fn on_retry_exhausted(&self, _trans: &TransGlobal) {}
}

/// Tracing-based observer
pub struct TracingObserver;

impl TransObserver for TracingObserver {
    fn on_submitted(&self, trans: &TransGlobal) {
        tracing::info!(gid = %trans.gid, protocol = %trans.protocol, branches = trans.branches.len(), "Transaction submitted");
    }

    fn on_branch_succeeded(&self, trans: &TransGlobal, branch: &Branch) {
        tracing::info!(gid = %trans.gid, branch_id = %branch.branch_id, op = %branch.op, attempts = branch.attempts, "Branch succeeded");
    }

    fn on_branch_failed(&self, trans: &TransGlobal, branch: &Branch, reason: &str) {
        if branch.op.is_forward() {
            tracing::warn!(gid = %trans.gid, branch_id = %branch.branch_id, op = %branch.op, reason = %reason, "Branch failed");
        } else {
            tracing::error!(gid = %trans.gid, branch_id = %branch.branch_id, op = %branch.op, reason = %reason, "Second-phase branch rejected, will retry");
        }
    }

    fn on_branch_pending(&self, trans: &TransGlobal, branch: &Branch, reason: &str) {
        tracing::info!(gid = %trans.gid, branch_id = %branch.branch_id, op = %branch.op, reason = %reason, "Branch pending");
    }

    fn on_status_changed(&self, trans: &TransGlobal, from: TransStatus) {
        match trans.status {
            TransStatus::Failed => {
                tracing::warn!(gid = %trans.gid, from = %from, reason = ?trans.rollback_reason, "Transaction failed")
            }
            to => tracing::info!(gid = %trans.gid, from = %from, to = %to, "Transaction status changed"),
        }
    }

    fn on_retry_exhausted(&self, trans: &TransGlobal) {
        tracing::error!(gid = %trans.gid, retries = trans.retry_count, "Forward retries exhausted, aborting");
    }
}
