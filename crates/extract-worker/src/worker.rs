// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker main loop.
//!
//! Claims runs up to the concurrency limit, dispatches each claim to the
//! [`RunProcessor`] on its own task, and otherwise blocks on the queue
//! listener. The wait is bounded by the listen timeout, the next maintenance
//! sweep and the earliest not-yet-due run, so delayed retries are picked up
//! without a notification.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use rand::Rng;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::listener::{QueueListener, Wakeup};
use crate::processor::{RunOutcome, RunProcessor};
use crate::retry::RetryPolicy;
use crate::store::LeaseStore;

const MIN_WAIT: Duration = Duration::from_millis(10);

/// Worker loop configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity written into leases.
    pub worker_id: String,
    /// Maximum runs in flight.
    pub concurrency: usize,
    /// Maximum runs claimed per query.
    pub claim_batch_size: usize,
    /// Lease duration granted on claim.
    pub lease_seconds: i64,
    /// Longest single wait on the listener.
    pub listen_timeout: Duration,
    /// Period of the lease-expiry sweep.
    pub maintenance_interval: Duration,
    /// Backoff applied by the sweep.
    pub retry: RetryPolicy,
    /// How long shutdown waits for in-flight runs.
    pub shutdown_grace: Duration,
    /// Upper bound of the random delay after a notification.
    pub jitter_max: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker".to_string(),
            concurrency: 2,
            claim_batch_size: 2,
            lease_seconds: 900,
            listen_timeout: Duration::from_secs(60),
            maintenance_interval: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            shutdown_grace: Duration::from_secs(30),
            jitter_max: Duration::from_millis(250),
        }
    }
}

/// Claims and dispatches runs until shut down.
pub struct Worker {
    store: Arc<dyn LeaseStore>,
    processor: Arc<RunProcessor>,
    listener: Box<dyn QueueListener>,
    config: WorkerConfig,
    shutdown: Arc<Notify>,
}

impl Worker {
    /// Create a worker.
    pub fn new(
        store: Arc<dyn LeaseStore>,
        processor: Arc<RunProcessor>,
        listener: Box<dyn QueueListener>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            processor,
            listener,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the loop until shutdown, then drain in-flight runs.
    pub async fn run(mut self) {
        info!(
            worker_id = %self.config.worker_id,
            concurrency = self.config.concurrency,
            lease_seconds = self.config.lease_seconds,
            "Worker started"
        );

        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut next_maintenance = Instant::now();

        loop {
            while let Some(joined) = tasks.try_join_next() {
                log_join(joined);
            }

            if Instant::now() >= next_maintenance {
                self.run_maintenance().await;
                next_maintenance = Instant::now() + self.config.maintenance_interval;
            }

            self.fill_capacity(&mut tasks).await;

            let wait = self.wait_duration(next_maintenance).await;
            let has_tasks = !tasks.is_empty();

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!(in_flight = tasks.len(), "Worker shutting down");
                    break;
                }

                Some(joined) = tasks.join_next(), if has_tasks => {
                    log_join(joined);
                }

                wakeup = self.listener.wait(wait) => {
                    if wakeup == Wakeup::Notified && !self.config.jitter_max.is_zero() {
                        // Spread the herd of workers woken by one notification.
                        let jitter_ms = rand::thread_rng()
                            .gen_range(0..=self.config.jitter_max.as_millis() as u64);
                        tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
                    }
                }
            }
        }

        self.drain(tasks).await;
        info!(worker_id = %self.config.worker_id, "Worker stopped");
    }

    async fn run_maintenance(&self) {
        match self
            .store
            .expire_run_leases(Utc::now(), &self.config.retry)
            .await
        {
            Ok(0) => debug!("No expired leases"),
            Ok(count) => info!(count, "Recovered runs with expired leases"),
            Err(e) => error!(error = %e, "Lease expiry sweep failed"),
        }
    }

    async fn fill_capacity(&self, tasks: &mut JoinSet<()>) {
        while tasks.len() < self.config.concurrency {
            let limit = (self.config.concurrency - tasks.len()).min(self.config.claim_batch_size);
            let claims = match self
                .store
                .claim_runs(
                    &self.config.worker_id,
                    Utc::now(),
                    self.config.lease_seconds,
                    limit,
                )
                .await
            {
                Ok(claims) => claims,
                Err(e) => {
                    error!(error = %e, "Failed to claim runs");
                    return;
                }
            };

            if claims.is_empty() {
                return;
            }
            debug!(count = claims.len(), "Claimed runs");

            let exhausted = claims.len() < limit;
            for claim in claims {
                let processor = self.processor.clone();
                tasks.spawn(async move {
                    let run_id = claim.run_id.clone();
                    match AssertUnwindSafe(processor.process(claim))
                        .catch_unwind()
                        .await
                    {
                        Ok(Ok(outcome)) => log_outcome(&run_id, &outcome),
                        Ok(Err(e)) => {
                            error!(run_id = %run_id, error = %e, "Run processing failed; lease will expire")
                        }
                        Err(_) => {
                            error!(run_id = %run_id, "Run processing panicked; lease will expire")
                        }
                    }
                });
            }
            if exhausted {
                return;
            }
        }
    }

    async fn wait_duration(&self, next_maintenance: Instant) -> Duration {
        let mut wait = self
            .config
            .listen_timeout
            .min(next_maintenance.saturating_duration_since(Instant::now()));

        let now = Utc::now();
        match self.store.next_due_at(now).await {
            Ok(Some(due)) => {
                let until_due = (due - now).to_std().unwrap_or(Duration::ZERO);
                wait = wait.min(until_due);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to look up next due run"),
        }

        wait.max(MIN_WAIT)
    }

    async fn drain(&self, mut tasks: JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }
        info!(
            in_flight = tasks.len(),
            grace_secs = self.config.shutdown_grace.as_secs(),
            "Waiting for in-flight runs"
        );

        let deadline = Instant::now() + self.config.shutdown_grace;
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(joined)) => log_join(joined),
                Ok(None) => return,
                Err(_) => {
                    warn!(
                        in_flight = tasks.len(),
                        "Shutdown grace elapsed, abandoning in-flight runs"
                    );
                    tasks.shutdown().await;
                    return;
                }
            }
        }
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Run task failed");
    }
}

fn log_outcome(run_id: &str, outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Succeeded => debug!(run_id = %run_id, "Run task finished: succeeded"),
        RunOutcome::RetryScheduled(at) => {
            debug!(run_id = %run_id, retry_at = %at, "Run task finished: retry scheduled")
        }
        RunOutcome::Failed => debug!(run_id = %run_id, "Run task finished: failed"),
        RunOutcome::Abandoned => debug!(run_id = %run_id, "Run task finished: abandoned"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>(_: &T) {}

    // Compiles only while the loop can be handed to `tokio::spawn`.
    #[allow(dead_code)]
    fn run_future_is_send(worker: Worker) {
        assert_send(&worker.run());
    }

    #[test]
    fn test_default_config_claims_within_concurrency() {
        let config = WorkerConfig::default();
        assert!(config.claim_batch_size <= config.concurrency);
        assert!(config.listen_timeout >= MIN_WAIT);
    }
}
