//! Branch barrier: participant-side idempotency and ordering guard
//!
//! Every barrier-protected call records a ledger row keyed by
//! `(gid, branch_id, op, barrier_id)` inside the participant's own local
//! transaction, together with the business effect. The row's presence means
//! the operation already ran or is permanently suppressed:
//!
//! - a replayed call finds its row and skips the effect (`Duplicate`)
//! - a compensating call first writes the row of the forward op it undoes;
//!   if that write succeeds the forward op never ran, so the compensation is
//!   a no-op (`NullCompensation`)
//! - a forward call arriving after such a compensation finds its row written
//!   by the compensation and skips the effect (`Suspended`)

use crate::{BarrierError, BranchOp, LedgerError, Protocol};
use serde::{Deserialize, Serialize};

/// Branch id used by the prepared marker
pub const PREPARED_BRANCH_ID: &str = "00";

/// Barrier id used by the prepared marker
pub const PREPARED_BARRIER_ID: &str = "01";

/// Ledger key of one barrier-protected operation
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BarrierKey {
    /// Global transaction id
    pub gid: String,
    /// Branch ordinal within the transaction
    pub branch_id: String,
    /// Operation
    pub op: BranchOp,
    /// Sub-op index of the call within one branch handler ("01", "02", ...)
    pub barrier_id: String,
}

impl BarrierKey {
    /// Create a barrier key
    pub fn new(
        gid: impl Into<String>,
        branch_id: impl Into<String>,
        op: BranchOp,
        barrier_id: impl Into<String>,
    ) -> Self {
        Self {
            gid: gid.into(),
            branch_id: branch_id.into(),
            op,
            barrier_id: barrier_id.into(),
        }
    }

    /// Key of the prepared marker for a gid
    pub fn prepared_marker(gid: impl Into<String>) -> Self {
        Self::new(gid, PREPARED_BRANCH_ID, BranchOp::Prepare, PREPARED_BARRIER_ID)
    }

    /// Flat string form, usable as a key in ordered byte stores
    pub fn encode(&self) -> String {
        format!(
            "{}\u{1f}{}\u{1f}{}\u{1f}{}",
            self.gid, self.branch_id, self.op, self.barrier_id
        )
    }
}

impl std::fmt::Display for BarrierKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.gid, self.branch_id, self.op, self.barrier_id
        )
    }
}

/// Ledger row contents
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRow {
    /// Protocol of the calling transaction
    pub protocol: Protocol,
    /// Op whose call inserted this row
    pub reason: BranchOp,
}

/// Bookkeeping primitives a local transaction must offer to the barrier
pub trait BarrierTx {
    /// Insert the row if absent. Returns `true` if it was inserted.
    fn insert_barrier(&mut self, key: &BarrierKey, row: LedgerRow) -> Result<bool, LedgerError>;

    /// Read an existing row
    fn barrier_row(&mut self, key: &BarrierKey) -> Result<Option<LedgerRow>, LedgerError>;
}

/// A local transaction that can be finished
pub trait LocalTransaction: BarrierTx {
    /// Make the ledger rows and business effects durable together
    fn commit(self) -> Result<(), LedgerError>;

    /// Discard the ledger rows and business effects together
    fn rollback(self) -> Result<(), LedgerError>;
}

/// Participant storage able to open local transactions
pub trait BarrierStore: Send + Sync {
    /// Transaction handle
    type Tx<'a>: LocalTransaction
    where
        Self: 'a;

    /// Open a local transaction
    fn begin(&self) -> Result<Self::Tx<'_>, LedgerError>;
}

/// What a barrier call did. Every variant is a success for the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarrierOutcome {
    /// Row inserted, business effect applied
    Applied,
    /// Same call already ran; effect skipped
    Duplicate,
    /// Compensation before its forward op; forward op is now suppressed
    NullCompensation,
    /// Forward op after its compensation; effect skipped
    Suspended,
}

impl BarrierOutcome {
    /// Check if the business function ran
    pub fn applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Result of [`BranchBarrier::query_prepared`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreparedState {
    /// The forward path reached this participant
    Prepared,
    /// Nothing was prepared; the gid is now blocked from preparing
    RolledBack,
}

/// Barrier for one incoming branch call
#[derive(Clone, Debug)]
pub struct BranchBarrier {
    /// Protocol of the calling transaction
    pub protocol: Protocol,
    /// Global transaction id
    pub gid: String,
    /// Branch ordinal
    pub branch_id: String,
    /// Operation being called
    pub op: BranchOp,
    barrier_id: u32,
}

impl BranchBarrier {
    /// Create a barrier for a branch call
    pub fn new(protocol: Protocol, gid: impl Into<String>, branch_id: impl Into<String>, op: BranchOp) -> Self {
        Self {
            protocol,
            gid: gid.into(),
            branch_id: branch_id.into(),
            op,
            barrier_id: 0,
        }
    }

    /// Create a barrier from the request the coordinator sent
    pub fn from_request(req: &crate::BranchRequest) -> Self {
        Self::new(req.protocol, req.gid.clone(), req.branch_id.clone(), req.op)
    }

    fn key(&self, op: BranchOp, barrier_id: &str) -> BarrierKey {
        BarrierKey::new(self.gid.clone(), self.branch_id.clone(), op, barrier_id)
    }

    /// Run `business` at most once for this `(gid, branch_id, op, sub-op)`,
    /// inside the caller's open local transaction.
    ///
    /// The caller commits `tx` on `Ok` and rolls it back on `Err`.
    pub fn call<T, F, E>(&mut self, tx: &mut T, business: F) -> Result<BarrierOutcome, BarrierError<E>>
    where
        T: BarrierTx,
        F: FnOnce(&mut T) -> Result<(), E>,
    {
        self.barrier_id += 1;
        let bid = format!("{:02}", self.barrier_id);
        let row = LedgerRow {
            protocol: self.protocol,
            reason: self.op,
        };

        let origin_inserted = match self.op.origin() {
            Some(origin) => tx.insert_barrier(&self.key(origin, &bid), row.clone())?,
            None => false,
        };
        let current_key = self.key(self.op, &bid);
        let current_inserted = tx.insert_barrier(&current_key, row)?;

        if origin_inserted {
            tracing::info!(gid = %self.gid, branch_id = %self.branch_id, op = %self.op, "null compensation");
            return Ok(BarrierOutcome::NullCompensation);
        }
        if !current_inserted {
            let existing = tx.barrier_row(&current_key)?;
            let outcome = match existing {
                Some(row) if row.reason != self.op => BarrierOutcome::Suspended,
                _ => BarrierOutcome::Duplicate,
            };
            tracing::debug!(key = %current_key, ?outcome, "barrier skipped business call");
            return Ok(outcome);
        }

        business(tx).map_err(BarrierError::Business)?;
        Ok(BarrierOutcome::Applied)
    }

    /// Open a local transaction on `store`, run [`call`](Self::call) in it,
    /// then commit on success or roll back on failure.
    pub fn call_with_store<'s, S, F, E>(
        &mut self,
        store: &'s S,
        business: F,
    ) -> Result<BarrierOutcome, BarrierError<E>>
    where
        S: BarrierStore,
        F: FnOnce(&mut S::Tx<'s>) -> Result<(), E>,
    {
        let mut tx = store.begin()?;
        match self.call(&mut tx, business) {
            Ok(outcome) => {
                tx.commit()?;
                Ok(outcome)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback() {
                    tracing::warn!(gid = %self.gid, error = %rollback_err, "barrier rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Record, inside the forward path's local transaction, that this gid
    /// reached the participant. Suppressed once `query_prepared` has
    /// declared the gid rolled back.
    pub fn prepare<T, F, E>(&mut self, tx: &mut T, business: F) -> Result<BarrierOutcome, BarrierError<E>>
    where
        T: BarrierTx,
        F: FnOnce(&mut T) -> Result<(), E>,
    {
        let key = BarrierKey::prepared_marker(self.gid.clone());
        let row = LedgerRow {
            protocol: self.protocol,
            reason: BranchOp::Prepare,
        };
        if !tx.insert_barrier(&key, row)? {
            return Ok(match tx.barrier_row(&key)? {
                Some(row) if row.reason == BranchOp::Rollback => BarrierOutcome::Suspended,
                _ => BarrierOutcome::Duplicate,
            });
        }
        business(tx).map_err(BarrierError::Business)?;
        Ok(BarrierOutcome::Applied)
    }

    /// Ask whether the forward path ever reached this participant for the
    /// gid. If it did not, a rollback marker is written so a late forward
    /// call can no longer prepare.
    pub fn query_prepared<S: BarrierStore>(&self, store: &S) -> Result<PreparedState, LedgerError> {
        let key = BarrierKey::prepared_marker(self.gid.clone());
        let mut tx = store.begin()?;
        tx.insert_barrier(
            &key,
            LedgerRow {
                protocol: self.protocol,
                reason: BranchOp::Rollback,
            },
        )?;
        let row = tx.barrier_row(&key)?;
        tx.commit()?;
        match row {
            Some(row) if row.reason == BranchOp::Rollback => Ok(PreparedState::RolledBack),
            _ => Ok(PreparedState::Prepared),
        }
    }
}
