// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lease handle held by one run attempt.
//!
//! The handle owns the attempt's heartbeat schedule. Every phase of an
//! attempt (lock wait, build steps, engine) renews against the same deadline,
//! so a sequence of short phases still heartbeats on time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::{RunClaim, RunFailure, RunSuccess};
use crate::store::LeaseStore;
use crate::subprocess::Heartbeat;

/// Ownership of a claimed run for the duration of one attempt.
///
/// Once the lease is observed lost it stays lost; an unreachable store
/// counts as loss.
pub struct RunLease {
    store: Arc<dyn LeaseStore>,
    worker_id: String,
    claim: RunClaim,
    lease_seconds: i64,
    heartbeat_interval: Duration,
    next_beat: Mutex<Instant>,
    lost: AtomicBool,
}

impl RunLease {
    /// Wrap a fresh claim. The claim itself counts as the first heartbeat.
    pub fn new(
        store: Arc<dyn LeaseStore>,
        worker_id: impl Into<String>,
        claim: RunClaim,
        lease_seconds: i64,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
            claim,
            lease_seconds,
            heartbeat_interval,
            next_beat: Mutex::new(Instant::now() + heartbeat_interval),
            lost: AtomicBool::new(false),
        }
    }

    /// The underlying claim.
    pub fn claim(&self) -> &RunClaim {
        &self.claim
    }

    /// Claimed run id.
    pub fn run_id(&self) -> &str {
        &self.claim.run_id
    }

    /// Whether loss has been observed.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// `Err(LeaseLost)` once loss has been observed.
    pub fn ensure_held(&self) -> Result<()> {
        if self.is_lost() {
            Err(Error::LeaseLost(self.claim.run_id.clone()))
        } else {
            Ok(())
        }
    }

    /// When the next heartbeat is due.
    pub fn next_beat_at(&self) -> Instant {
        match self.next_beat.lock() {
            Ok(next) => *next,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Renew only if the heartbeat is due; `false` when the lease is lost.
    pub async fn renew_if_due(&self) -> bool {
        if self.is_lost() {
            return false;
        }
        if Instant::now() < self.next_beat_at() {
            return true;
        }
        self.renew().await
    }

    /// Renew now, or fail with `LeaseLost`.
    ///
    /// Used before durable writes so a stale attempt never publishes results.
    pub async fn confirm(&self) -> Result<()> {
        if self.renew().await {
            Ok(())
        } else {
            Err(Error::LeaseLost(self.claim.run_id.clone()))
        }
    }

    /// Extend the lease; `false` when it is lost.
    pub async fn renew(&self) -> bool {
        if self.is_lost() {
            return false;
        }
        let renewed = match self
            .store
            .heartbeat_run(
                &self.claim.run_id,
                &self.worker_id,
                self.claim.lease_token,
                Utc::now(),
                self.lease_seconds,
            )
            .await
        {
            Ok(renewed) => renewed,
            Err(e) => {
                warn!(run_id = %self.claim.run_id, error = %e, "Heartbeat failed, treating lease as lost");
                false
            }
        };
        if renewed {
            self.schedule_next_beat();
            debug!(run_id = %self.claim.run_id, "Lease renewed");
        } else {
            self.mark_lost();
        }
        renewed
    }

    /// Acknowledge success; `false` when the lease was lost.
    pub async fn ack_success(&self, success: &RunSuccess) -> Result<bool> {
        self.ensure_held()?;
        let acked = self
            .store
            .ack_run_success(
                &self.claim.run_id,
                &self.worker_id,
                self.claim.lease_token,
                Utc::now(),
                success,
            )
            .await?;
        if !acked {
            self.mark_lost();
        }
        Ok(acked)
    }

    /// Acknowledge failure; `false` when the lease was lost.
    pub async fn ack_failure(&self, failure: &RunFailure) -> Result<bool> {
        self.ensure_held()?;
        let acked = self
            .store
            .ack_run_failure(
                &self.claim.run_id,
                &self.worker_id,
                self.claim.lease_token,
                Utc::now(),
                failure,
            )
            .await?;
        if !acked {
            self.mark_lost();
        }
        Ok(acked)
    }

    fn schedule_next_beat(&self) {
        let next = Instant::now() + self.heartbeat_interval;
        match self.next_beat.lock() {
            Ok(mut slot) => *slot = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    fn mark_lost(&self) {
        if !self.lost.swap(true, Ordering::SeqCst) {
            warn!(run_id = %self.claim.run_id, worker_id = %self.worker_id, "Lease lost");
        }
    }
}

#[async_trait]
impl Heartbeat for RunLease {
    async fn beat(&self) -> bool {
        self.renew_if_due().await
    }

    fn next_due(&self) -> Option<Instant> {
        Some(self.next_beat_at())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewRun;
    use crate::store::MemoryLeaseStore;

    async fn claimed(store: &Arc<MemoryLeaseStore>) -> RunClaim {
        store.enqueue_run(NewRun::new("ws", "cfg", "doc"));
        store
            .claim_runs("worker-a", Utc::now(), 60, 1)
            .await
            .unwrap()
            .remove(0)
    }

    #[tokio::test]
    async fn test_renew_keeps_lease() {
        let store = Arc::new(MemoryLeaseStore::new());
        let claim = claimed(&store).await;
        let lease = RunLease::new(store.clone(), "worker-a", claim, 60, Duration::from_secs(30));

        assert!(lease.renew().await);
        assert!(!lease.is_lost());
        assert!(lease.ensure_held().is_ok());
    }

    #[tokio::test]
    async fn test_loss_is_sticky() {
        let store = Arc::new(MemoryLeaseStore::new());
        let claim = claimed(&store).await;
        let run_id = claim.run_id.clone();
        let lease = RunLease::new(store.clone(), "worker-a", claim, 60, Duration::from_secs(30));

        store.expire_lease(&run_id);
        assert!(!lease.renew().await);
        assert!(lease.is_lost());
        assert!(lease.ensure_held().unwrap_err().is_lease_lost());

        let success = RunSuccess::default();
        assert!(lease.ack_success(&success).await.is_err());
    }

    #[tokio::test]
    async fn test_second_ack_reports_loss() {
        let store = Arc::new(MemoryLeaseStore::new());
        let claim = claimed(&store).await;
        let lease = RunLease::new(store.clone(), "worker-a", claim, 60, Duration::from_secs(30));

        assert!(lease.ack_success(&RunSuccess::default()).await.unwrap());
        // The first ack cleared the lease token.
        assert!(!lease.renew().await);
    }

    #[tokio::test]
    async fn test_renew_if_due_skips_store_until_due() {
        let store = Arc::new(MemoryLeaseStore::new());
        let claim = claimed(&store).await;
        let run_id = claim.run_id.clone();
        let lease = RunLease::new(store.clone(), "worker-a", claim, 60, Duration::from_secs(30));

        // Not due: the expired lease goes unnoticed until the next beat.
        store.expire_lease(&run_id);
        assert!(lease.renew_if_due().await);
        assert!(!lease.is_lost());

        assert!(lease.confirm().await.unwrap_err().is_lease_lost());
        assert!(!lease.renew_if_due().await);
    }

    #[tokio::test]
    async fn test_schedule_is_shared_across_callers() {
        let store = Arc::new(MemoryLeaseStore::new());
        let claim = claimed(&store).await;
        let lease = RunLease::new(store.clone(), "worker-a", claim, 60, Duration::from_millis(50));

        let first_due = lease.next_beat_at();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(Instant::now() >= first_due);

        assert!(lease.renew_if_due().await);
        let second_due = lease.next_beat_at();
        assert!(second_due > first_due);
        assert!(second_due > Instant::now());

        // A beat through the subprocess seam uses the same deadline.
        assert_eq!(lease.next_due(), Some(second_due));
        assert!(lease.beat().await);
        assert_eq!(lease.next_beat_at(), second_due);
    }
}
