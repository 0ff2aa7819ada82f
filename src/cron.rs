//! Recovery scheduler
//!
//! Sweeps the store for unfinished transactions whose next cron time has
//! passed and runs a dispatch pass on each, exactly as if resuming after a
//! crash. Claims carry a lease, so schedulers sharing a store do not work the
//! same gid at the same time.

use crate::engine::Engine;
use crate::{CoordinatorError, CoordinatorStats};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Periodic driver of unfinished transactions
#[derive(Clone)]
pub struct RecoveryScheduler {
    engine: Arc<Engine>,
}

impl RecoveryScheduler {
    pub(crate) fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Run one sweep; returns how many transactions were claimed
    pub async fn run_once(&self) -> Result<usize, CoordinatorError> {
        let config = &self.engine.config;
        let due = self.engine.store.claim_due(
            self.engine.now_millis(),
            config.lease_millis,
            config.cron_batch_size,
        )?;
        let claimed = due.len();

        for trans in due {
            let gid = trans.gid.clone();
            match self.engine.process(trans).await {
                Ok(trans) => {
                    tracing::debug!(gid = %gid, status = %trans.status, "Recovery pass finished");
                }
                Err(e) if e.is_retryable() => {
                    tracing::debug!(gid = %gid, error = %e, "Recovery pass interrupted");
                }
                Err(e) => {
                    tracing::warn!(gid = %gid, error = %e, "Recovery pass failed");
                }
            }
        }
        Ok(claimed)
    }

    /// Sweep until `shutdown` turns true or its sender is dropped.
    ///
    /// A sweep that fills a whole batch is followed by another one right
    /// away; otherwise the loop sleeps for the configured interval.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_millis(self.engine.config.cron_interval_millis);
        tracing::info!(interval_ms = self.engine.config.cron_interval_millis, "Recovery scheduler started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let full = match self.run_once().await {
                Ok(claimed) => claimed >= self.engine.config.cron_batch_size,
                Err(e) => {
                    tracing::warn!(error = %e, "Recovery sweep failed");
                    false
                }
            };
            if full {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!(passes = self.engine.stats.passes.load(std::sync::atomic::Ordering::Relaxed), "Recovery scheduler stopped");
    }

    /// Counters shared with the coordinator
    pub fn stats(&self) -> &CoordinatorStats {
        &self.engine.stats
    }
}
