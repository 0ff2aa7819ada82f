//! Error types for the coordinator, its stores and branch barriers

use serde::{Deserialize, Serialize};

/// Error returned by a participant's business function
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum BranchError {
    /// Participant rejected the operation; drives the abort path
    #[error("branch failure: {0}")]
    Failure(String),
    /// Participant is not done yet; retry later
    #[error("branch ongoing")]
    Ongoing,
}

impl BranchError {
    /// Create a failure with the given reason
    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Failure(reason.into())
    }

    /// Check if this error asks for a later retry
    pub fn is_ongoing(&self) -> bool {
        matches!(self, Self::Ongoing)
    }
}

/// Error from the participant's barrier ledger
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The ledger backend failed to read or write
    #[error("Storage error: {0}")]
    Storage(Box<str>),
    /// The local transaction did not commit; nothing it wrote is visible
    #[error("Commit failed: {0}")]
    CommitFailed(Box<str>),
}

/// Error from a barrier-protected call
#[derive(Debug, thiserror::Error)]
pub enum BarrierError<E> {
    /// Ledger bookkeeping failed; nothing was durably written
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    /// The business function failed; its local transaction was rolled back
    #[error("business error: {0}")]
    Business(E),
}

impl BarrierError<BranchError> {
    /// Collapse into the participant-level error sent back to the coordinator.
    ///
    /// Ledger failures are retryable, so they surface as `Ongoing`.
    pub fn into_branch_error(self) -> BranchError {
        match self {
            Self::Ledger(e) => {
                tracing::warn!(error = %e, "barrier ledger failure, reporting ongoing");
                BranchError::Ongoing
            }
            Self::Business(e) => e,
        }
    }
}

/// Error from the coordinator's transaction store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No record with this gid
    #[error("Transaction not found: {0}")]
    NotFound(String),
    /// A record with this gid was already created
    #[error("Transaction already exists: {0}")]
    AlreadyExists(String),
    /// Another writer saved the record since it was loaded
    #[error("Version conflict on {gid}: expected {expected}, found {actual}")]
    VersionConflict {
        /// Record written
        gid: String,
        /// Version the writer loaded
        expected: u64,
        /// Version found in the store
        actual: u64,
    },
    /// The record is terminal and can no longer change
    #[error("Transaction already finished: {0}")]
    Finished(String),
    /// Stored bytes could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(Box<str>),
    /// The storage backend failed
    #[error("Storage error: {0}")]
    Storage(Box<str>),
}

/// Error delivering a branch call
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// No participant answers at this target
    #[error("Participant unreachable: {0}")]
    Unreachable(String),
    /// The call did not answer within the configured timeout (milliseconds)
    #[error("Branch call timed out after {0}ms")]
    Timeout(u64),
    /// The participant answered with something that is not a branch result
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Error surfaced to coordinator callers
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// The transaction store failed
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The first pass ended on the abort path
    #[error("Transaction failed: {0}")]
    Failure(String),
    /// The first pass ended with work still pending
    #[error("Transaction ongoing")]
    Ongoing,
    /// No workflow registered under this name
    #[error("Unknown workflow: {0}")]
    UnknownWorkflow(String),
    /// The gid was already submitted under another protocol
    #[error("Transaction {0} exists with a different protocol")]
    Conflict(String),
    /// The definition cannot be turned into a branch plan
    #[error("Invalid transaction definition: {0}")]
    InvalidDefinition(String),
    /// A configuration value is out of range
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl CoordinatorError {
    /// Check if a later recovery pass may resolve this
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Ongoing | Self::Store(StoreError::VersionConflict { .. }))
    }
}
