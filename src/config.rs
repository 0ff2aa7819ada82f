//! Coordinator configuration

use crate::CoordinatorError;
use serde::{Deserialize, Serialize};

/// Retry policy for dispatch passes
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Consecutive forward-phase passes without a branch finishing before the
    /// transaction aborts
    pub max_attempts: u32,
    /// Initial delay before first retry (milliseconds)
    pub initial_delay_millis: u64,
    /// Maximum delay cap (milliseconds)
    pub max_delay_millis: u64,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_millis: 10_000,
            max_delay_millis: 600_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for a given attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        if attempt == 0 {
            return std::time::Duration::from_millis(0);
        }

        let delay = self.initial_delay_millis as f64
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = delay.min(self.max_delay_millis as f64);
        std::time::Duration::from_millis(capped as u64)
    }

    /// Check if `retry_count` stalled passes use up the forward phase's retries
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_attempts
    }
}

/// Coordinator settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Backoff and retry bound
    pub retry: RetryPolicy,
    /// Sleep between recovery scheduler sweeps
    pub cron_interval_millis: u64,
    /// Transactions claimed per sweep
    pub cron_batch_size: usize,
    /// How far a claimed transaction's next cron time is pushed before dispatch
    pub lease_millis: u64,
    /// Per-call timeout for branch invocations
    pub branch_timeout_millis: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            cron_interval_millis: 3_000,
            cron_batch_size: 64,
            lease_millis: 10_000,
            branch_timeout_millis: 30_000,
        }
    }
}

impl CoordinatorConfig {
    /// Load from a JSON document; absent fields keep their defaults
    pub fn from_json_str(json: &str) -> Result<Self, CoordinatorError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| CoordinatorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), CoordinatorError> {
        if self.retry.max_attempts == 0 {
            return Err(CoordinatorError::Config("retry.max_attempts must be positive".into()));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(CoordinatorError::Config("retry.backoff_multiplier must be >= 1".into()));
        }
        if self.cron_batch_size == 0 {
            return Err(CoordinatorError::Config("cron_batch_size must be positive".into()));
        }
        Ok(())
    }

    /// Per-call timeout as a duration
    pub fn branch_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.branch_timeout_millis)
    }
}
