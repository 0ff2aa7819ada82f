//! Global transaction and branch records

use serde::{Deserialize, Serialize};

/// Transaction protocol driving a global transaction
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Forward actions with reverse-order compensations
    Saga,
    /// Try / Confirm / Cancel
    Tcc,
    /// Prepare-style action followed by commit or rollback
    Xa,
    /// Resumable step sequence with registered phase-2 steps
    Workflow,
}

impl Protocol {
    /// Lowercase protocol name
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Saga => "saga",
            Protocol::Tcc => "tcc",
            Protocol::Xa => "xa",
            Protocol::Workflow => "workflow",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a global transaction.
///
/// `Succeed` and `Failed` are terminal; a record in either state is never
/// mutated again.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TransStatus {
    /// Accepted; saga actions, or the commit phase of two-phase protocols
    Submitted,
    /// Phase one of TCC / XA / Workflow in progress
    Prepared,
    /// Compensation, cancel or rollback in progress
    Aborting,
    /// All branches committed
    Succeed,
    /// All required compensations done
    Failed,
}

impl TransStatus {
    /// Check if no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeed | Self::Failed)
    }

    /// Lowercase status name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Prepared => "prepared",
            Self::Aborting => "aborting",
            Self::Succeed => "succeed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TransStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single branch
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum BranchStatus {
    /// Not yet completed (never called, or last call was pending)
    Prepared,
    /// Participant reported success
    Succeed,
    /// Participant reported a definite failure
    Failed,
}

impl BranchStatus {
    /// Lowercase status name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prepared => "prepared",
            Self::Succeed => "succeed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for BranchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation a branch performs on its participant
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum BranchOp {
    /// Saga / XA / Workflow forward action
    Action,
    /// Saga / Workflow compensation
    Compensate,
    /// TCC try
    Try,
    /// TCC confirm
    Confirm,
    /// TCC cancel
    Cancel,
    /// XA / Workflow phase-2 commit
    Commit,
    /// XA rollback
    Rollback,
    /// Prepared marker written by participants
    Prepare,
}

impl BranchOp {
    /// Lowercase op name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Action => "action",
            Self::Compensate => "compensate",
            Self::Try => "try",
            Self::Confirm => "confirm",
            Self::Cancel => "cancel",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
            Self::Prepare => "prepare",
        }
    }

    /// Parse from the lowercase op name
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "action" => Self::Action,
            "compensate" => Self::Compensate,
            "try" => Self::Try,
            "confirm" => Self::Confirm,
            "cancel" => Self::Cancel,
            "commit" => Self::Commit,
            "rollback" => Self::Rollback,
            "prepare" => Self::Prepare,
            _ => return None,
        })
    }

    /// Forward ops whose definite failure starts the abort path
    pub fn is_forward(&self) -> bool {
        matches!(self, Self::Action | Self::Try)
    }

    /// Ops that undo a forward op
    pub fn is_compensating(&self) -> bool {
        matches!(self, Self::Compensate | Self::Cancel | Self::Rollback)
    }

    /// The forward op a compensating op undoes
    pub fn origin(&self) -> Option<BranchOp> {
        match self {
            Self::Compensate | Self::Rollback => Some(Self::Action),
            Self::Cancel => Some(Self::Try),
            _ => None,
        }
    }
}

impl std::fmt::Display for BranchOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One participant-facing step of a global transaction
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
pub struct Branch {
    /// Two-digit ordinal shared by the ops of one step ("01", "02", ...)
    pub branch_id: String,
    /// Operation this branch performs
    pub op: BranchOp,
    /// Participant endpoint
    pub target: String,
    /// Request body sent with the call
    pub payload: Vec<u8>,
    /// Current status
    pub status: BranchStatus,
    /// Number of calls issued so far
    pub attempts: u32,
    /// Response body of the successful call
    pub result: Vec<u8>,
    /// Reason of a definite failure
    pub error: Option<String>,
    /// When the branch reached a final status
    pub finished_at_millis: Option<u64>,
}

impl Branch {
    /// Create a branch that has not been called yet
    pub fn new(branch_id: impl Into<String>, op: BranchOp, target: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            branch_id: branch_id.into(),
            op,
            target: target.into(),
            payload,
            status: BranchStatus::Prepared,
            attempts: 0,
            result: Vec::new(),
            error: None,
            finished_at_millis: None,
        }
    }

    /// Check if the participant has reported a final result
    pub fn is_done(&self) -> bool {
        self.status != BranchStatus::Prepared
    }
}

/// Format a branch ordinal ("01", "02", ...)
pub fn branch_id(index: usize) -> String {
    format!("{:02}", index)
}

/// Global transaction record
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
pub struct TransGlobal {
    /// Caller-supplied unique id
    pub gid: String,
    /// Protocol driving this transaction
    pub protocol: Protocol,
    /// Current status
    pub status: TransStatus,
    /// Ordered branches
    pub branches: Vec<Branch>,
    /// Opaque caller data
    pub payload: Vec<u8>,
    /// Registered workflow name (workflow protocol only)
    pub workflow_name: Option<String>,
    /// Why the abort path was taken
    pub rollback_reason: Option<String>,
    /// Passes since the last status change or finished branch
    pub retry_count: u32,
    /// Earliest time the recovery scheduler may pick this record up
    pub next_cron_time_millis: u64,
    /// Creation time
    pub created_at_millis: u64,
    /// Last write time
    pub updated_at_millis: u64,
    /// When a terminal status was reached
    pub finished_at_millis: Option<u64>,
    /// Optimistic concurrency version, bumped by every store write
    pub version: u64,
}

impl TransGlobal {
    /// Create a new record with no retries scheduled yet
    pub fn new(
        gid: impl Into<String>,
        protocol: Protocol,
        status: TransStatus,
        branches: Vec<Branch>,
        payload: Vec<u8>,
        now_millis: u64,
    ) -> Self {
        Self {
            gid: gid.into(),
            protocol,
            status,
            branches,
            payload,
            workflow_name: None,
            rollback_reason: None,
            retry_count: 0,
            next_cron_time_millis: now_millis,
            created_at_millis: now_millis,
            updated_at_millis: now_millis,
            finished_at_millis: None,
            version: 0,
        }
    }

    /// Index of the branch with the given id and op
    pub fn find_branch(&self, branch_id: &str, op: BranchOp) -> Option<usize> {
        self.branches
            .iter()
            .position(|b| b.branch_id == branch_id && b.op == op)
    }

    /// Branch with the given id and op
    pub fn branch(&self, branch_id: &str, op: BranchOp) -> Option<&Branch> {
        self.find_branch(branch_id, op).map(|i| &self.branches[i])
    }

    /// Status of every branch, in order
    pub fn branch_statuses(&self) -> Vec<BranchStatus> {
        self.branches.iter().map(|b| b.status).collect()
    }

    /// Check if the paired forward branch has been called at least once
    pub fn origin_attempted(&self, branch: &Branch) -> bool {
        branch
            .op
            .origin()
            .and_then(|origin| self.branch(&branch.branch_id, origin))
            .map(|b| b.attempts > 0)
            .unwrap_or(false)
    }

    /// Move to a new status, resetting retry bookkeeping
    pub fn change_status(&mut self, status: TransStatus, now_millis: u64) {
        self.status = status;
        self.retry_count = 0;
        self.next_cron_time_millis = now_millis;
        if status.is_terminal() {
            self.finished_at_millis = Some(now_millis);
        }
    }
}
