// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lease store: the only cross-process coordination point.
//!
//! Every mutation of a claimed run is conditioned on the caller still owning
//! the lease (`lease_owner` + `lease_token` + `status = running`). A `false`
//! return means the lease was lost and the caller must abandon the attempt.
//!
//! Two implementations are provided:
//! - [`PgLeaseStore`]: PostgreSQL, used in production.
//! - [`MemoryLeaseStore`]: in-process, same semantics, used for tests and embedding.

mod memory;
mod postgres;

pub use memory::MemoryLeaseStore;
pub use postgres::PgLeaseStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    BuildMetadata, Document, Environment, EnvironmentKey, Run, RunClaim, RunFailure, RunSuccess,
};
use crate::retry::RetryPolicy;

/// Claim, heartbeat, acknowledgement and environment bookkeeping operations.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Atomically lease up to `limit` due runs to `worker_id`.
    ///
    /// A run is claimable when it is `queued` and due, or `running` with an
    /// expired lease and attempts left. Claiming increments `attempt_count`.
    async fn claim_runs(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_seconds: i64,
        limit: usize,
    ) -> Result<Vec<RunClaim>>;

    /// Extend the lease; `false` when the caller no longer owns it.
    async fn heartbeat_run(
        &self,
        run_id: &str,
        worker_id: &str,
        lease_token: Uuid,
        now: DateTime<Utc>,
        lease_seconds: i64,
    ) -> Result<bool>;

    /// Finalize a run as `succeeded`; `false` (and no write) on lease mismatch.
    async fn ack_run_success(
        &self,
        run_id: &str,
        worker_id: &str,
        lease_token: Uuid,
        now: DateTime<Utc>,
        success: &RunSuccess,
    ) -> Result<bool>;

    /// Requeue (`retry_at` set) or fail terminally; `false` on lease mismatch.
    async fn ack_run_failure(
        &self,
        run_id: &str,
        worker_id: &str,
        lease_token: Uuid,
        now: DateTime<Utc>,
        failure: &RunFailure,
    ) -> Result<bool>;

    /// Return runs whose lease expired to `queued` with backoff, or fail them
    /// once their attempts are spent. Returns the number of runs swept.
    async fn expire_run_leases(&self, now: DateTime<Utc>, retry: &RetryPolicy) -> Result<u64>;

    /// Earliest future `next_due_at` among queued runs.
    async fn next_due_at(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>>;

    /// Load a run.
    async fn get_run(&self, run_id: &str) -> Result<Option<Run>>;

    /// Load a document, including soft-deleted ones.
    async fn get_document(&self, document_id: &str) -> Result<Option<Document>>;

    /// Look up the environment for `key`, recording it as `queued` if unseen.
    async fn get_or_create_environment(
        &self,
        key: &EnvironmentKey,
        now: DateTime<Utc>,
    ) -> Result<Environment>;

    /// Load an environment.
    async fn get_environment(&self, environment_id: &str) -> Result<Option<Environment>>;

    /// Move to `building` and bump the build generation; returns the new generation.
    async fn mark_environment_building(
        &self,
        environment_id: &str,
        now: DateTime<Utc>,
    ) -> Result<i32>;

    /// Move to `ready` and record build metadata.
    async fn mark_environment_ready(
        &self,
        environment_id: &str,
        metadata: &BuildMetadata,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Move to `failed` so the next run that needs it rebuilds it.
    async fn mark_environment_failed(
        &self,
        environment_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Record that a run used the environment.
    async fn touch_environment(&self, environment_id: &str, now: DateTime<Utc>) -> Result<()>;

    /// Try to take the system-wide lock for `key` without blocking.
    async fn try_lock(&self, key: &str) -> Result<Option<Box<dyn EnvironmentLock>>>;
}

/// A held system-wide lock.
///
/// Must be released with [`EnvironmentLock::release`]; dropping a handle
/// still frees the lock, but without reporting errors.
#[async_trait]
pub trait EnvironmentLock: Send {
    /// Key the lock was taken for.
    fn key(&self) -> &str;

    /// Release the lock.
    async fn release(self: Box<Self>) -> Result<()>;
}

/// 64-bit advisory lock id derived from a lock key.
pub fn advisory_lock_id(key: &str) -> i64 {
    use sha2::{Digest, Sha256};

    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advisory_lock_id_is_stable_and_key_sensitive() {
        let a = advisory_lock_id("ws:cfg:extract-engine==1.0:sha256:abc");
        assert_eq!(a, advisory_lock_id("ws:cfg:extract-engine==1.0:sha256:abc"));
        assert_ne!(a, advisory_lock_id("ws:cfg:extract-engine==1.0:sha256:abd"));
    }
}
