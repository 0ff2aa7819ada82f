//! Branch call contract between the coordinator and participants

use crate::{BarrierError, BarrierOutcome, BranchError, BranchOp, Protocol, TransportError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A branch call as sent to a participant
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRequest {
    /// Protocol of the global transaction
    pub protocol: Protocol,
    /// Global transaction id
    pub gid: String,
    /// Step ordinal within the transaction
    pub branch_id: String,
    /// Operation the participant should perform
    pub op: BranchOp,
    /// Participant endpoint
    pub target: String,
    /// Request body
    pub payload: Vec<u8>,
}

/// Participant's answer to a branch call
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BranchResult {
    /// Done; carries the response body
    Success(Vec<u8>),
    /// Definite rejection
    Failure(String),
    /// Not finished, call again later
    Ongoing,
}

impl BranchResult {
    /// Wire marker, as carried by result-code based transports
    pub fn code(&self) -> &'static str {
        match self {
            Self::Success(_) => "SUCCESS",
            Self::Failure(_) => "FAILURE",
            Self::Ongoing => "ONGOING",
        }
    }
}

impl From<Result<Vec<u8>, BranchError>> for BranchResult {
    fn from(result: Result<Vec<u8>, BranchError>) -> Self {
        match result {
            Ok(body) => Self::Success(body),
            Err(BranchError::Failure(reason)) => Self::Failure(reason),
            Err(BranchError::Ongoing) => Self::Ongoing,
        }
    }
}

impl From<Result<BarrierOutcome, BarrierError<BranchError>>> for BranchResult {
    fn from(result: Result<BarrierOutcome, BarrierError<BranchError>>) -> Self {
        result
            .map(|_| Vec::new())
            .map_err(|e| e.into_branch_error())
            .into()
    }
}

/// Transport that delivers branch calls. Transport errors are retried.
#[async_trait]
pub trait BranchInvoker: Send + Sync + 'static {
    /// Deliver `request` and return the participant's answer
    async fn invoke(&self, request: &BranchRequest) -> Result<BranchResult, TransportError>;
}

/// A participant endpoint served in-process
#[async_trait]
pub trait BranchHandler: Send + Sync + 'static {
    /// Serve one branch call
    async fn handle(&self, request: &BranchRequest) -> BranchResult;
}

/// Invoker routing targets to in-process handlers
#[derive(Default)]
pub struct LocalInvoker {
    routes: RwLock<HashMap<String, Arc<dyn BranchHandler>>>,
}

impl LocalInvoker {
    /// Invoker with no routes
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `target` with `handler`, replacing any previous route
    pub fn route(&self, target: impl Into<String>, handler: Arc<dyn BranchHandler>) {
        if let Ok(mut routes) = self.routes.write() {
            routes.insert(target.into(), handler);
        }
    }

    /// Stop serving `target`; calls to it become unreachable
    pub fn unroute(&self, target: &str) {
        if let Ok(mut routes) = self.routes.write() {
            routes.remove(target);
        }
    }
}

#[async_trait]
impl BranchInvoker for LocalInvoker {
    async fn invoke(&self, request: &BranchRequest) -> Result<BranchResult, TransportError> {
        let handler = self
            .routes
            .read()
            .map_err(|e| TransportError::Protocol(e.to_string()))?
            .get(&request.target)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(request.target.clone()))?;
        Ok(handler.handle(request).await)
    }
}
