// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process lease store.
//!
//! Same contract as the PostgreSQL store, with state behind one mutex. Used
//! by tests and by embedders that run a single worker process.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

use super::{EnvironmentLock, LeaseStore};
use crate::error::{Error, Result};
use crate::models::{
    BuildMetadata, Document, Environment, EnvironmentKey, EnvironmentStatus, NewRun, Run,
    RunClaim, RunFailure, RunStatus, RunSuccess,
};
use crate::retry::RetryPolicy;

#[derive(Default)]
struct State {
    runs: HashMap<String, Run>,
    documents: HashMap<String, Document>,
    environments: HashMap<String, Environment>,
}

/// Lease store kept in memory.
pub struct MemoryLeaseStore {
    state: Mutex<State>,
    locks: Arc<Mutex<HashSet<String>>>,
    queue_notify: Arc<Notify>,
    unreachable: AtomicBool,
}

impl Default for MemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLeaseStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            locks: Arc::new(Mutex::new(HashSet::new())),
            queue_notify: Arc::new(Notify::new()),
            unreachable: AtomicBool::new(false),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::Other("lease store unreachable".to_string()));
        }
        Ok(())
    }

    /// Notified whenever a run becomes queued; pair with
    /// [`NotifyListener`](crate::listener::NotifyListener).
    pub fn queue_notify(&self) -> Arc<Notify> {
        self.queue_notify.clone()
    }

    /// Insert a queued run and wake listeners. Returns the run id.
    pub fn enqueue_run(&self, new_run: NewRun) -> String {
        let run = Run {
            id: new_run.id.clone(),
            workspace_id: new_run.workspace_id,
            configuration_id: new_run.configuration_id,
            input_document_id: new_run.input_document_id,
            engine_spec: new_run.engine_spec,
            dependency_digest: new_run.dependency_digest,
            status: RunStatus::Queued,
            attempt_count: 0,
            max_attempts: new_run.max_attempts,
            lease_owner: None,
            lease_token: None,
            lease_expires_at: None,
            next_due_at: new_run.next_due_at,
            run_options: new_run.run_options,
            environment_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            exit_code: None,
            error_message: None,
            output_path: None,
            summary: None,
        };
        self.state().runs.insert(run.id.clone(), run);
        self.queue_notify.notify_one();
        new_run.id
    }

    /// Record a document.
    pub fn insert_document(&self, document: Document) {
        self.state()
            .documents
            .insert(document.id.clone(), document);
    }

    /// Snapshot of a run.
    pub fn run(&self, run_id: &str) -> Option<Run> {
        self.state().runs.get(run_id).cloned()
    }

    /// Snapshot of the environment for `key`.
    pub fn environment(&self, key: &EnvironmentKey) -> Option<Environment> {
        self.state()
            .environments
            .values()
            .find(|env| env.key() == *key)
            .cloned()
    }

    /// Force a run's lease into the past, as if its owner stopped heartbeating.
    pub fn expire_lease(&self, run_id: &str) {
        if let Some(run) = self.state().runs.get_mut(run_id) {
            run.lease_expires_at = Some(Utc::now() - Duration::seconds(1));
        }
    }

    /// Make every subsequent heartbeat fail with an error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Whether a lock for `key` is currently held.
    pub fn is_locked(&self, key: &str) -> bool {
        lock_set(&self.locks).contains(key)
    }
}

fn lock_set(locks: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    match locks.lock() {
        Ok(set) => set,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn owns_lease(
    run: &Run,
    worker_id: &str,
    lease_token: Uuid,
    now: DateTime<Utc>,
) -> bool {
    run.status == RunStatus::Running
        && run.lease_owner.as_deref() == Some(worker_id)
        && run.lease_token == Some(lease_token)
        && run.lease_expires_at.is_some_and(|expires| expires > now)
}

fn clear_lease(run: &mut Run) {
    run.lease_owner = None;
    run.lease_token = None;
    run.lease_expires_at = None;
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn claim_runs(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_seconds: i64,
        limit: usize,
    ) -> Result<Vec<RunClaim>> {
        let mut state = self.state();

        let mut candidates: Vec<&mut Run> = state
            .runs
            .values_mut()
            .filter(|run| match run.status {
                RunStatus::Queued => run.next_due_at.is_none_or(|due| due <= now),
                RunStatus::Running => {
                    run.lease_expires_at.is_some_and(|expires| expires <= now)
                        && run.attempt_count < run.max_attempts
                }
                _ => false,
            })
            .collect();
        candidates.sort_by_key(|run| (run.next_due_at.unwrap_or(run.created_at), run.created_at));

        let claims = candidates
            .into_iter()
            .take(limit)
            .map(|run| {
                let token = Uuid::new_v4();
                run.status = RunStatus::Running;
                run.lease_owner = Some(worker_id.to_string());
                run.lease_token = Some(token);
                run.lease_expires_at = Some(now + Duration::seconds(lease_seconds));
                run.attempt_count += 1;
                run.started_at.get_or_insert(now);
                run.next_due_at = None;
                RunClaim {
                    run_id: run.id.clone(),
                    attempt_count: run.attempt_count,
                    max_attempts: run.max_attempts,
                    lease_token: token,
                }
            })
            .collect();
        Ok(claims)
    }

    async fn heartbeat_run(
        &self,
        run_id: &str,
        worker_id: &str,
        lease_token: Uuid,
        now: DateTime<Utc>,
        lease_seconds: i64,
    ) -> Result<bool> {
        self.check_reachable()?;
        let mut state = self.state();
        match state.runs.get_mut(run_id) {
            Some(run) if owns_lease(run, worker_id, lease_token, now) => {
                run.lease_expires_at = Some(now + Duration::seconds(lease_seconds));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ack_run_success(
        &self,
        run_id: &str,
        worker_id: &str,
        lease_token: Uuid,
        now: DateTime<Utc>,
        success: &RunSuccess,
    ) -> Result<bool> {
        let mut state = self.state();
        let Some(run) = state.runs.get_mut(run_id) else {
            return Ok(false);
        };
        if !owns_lease(run, worker_id, lease_token, now) {
            return Ok(false);
        }
        run.status = RunStatus::Succeeded;
        run.completed_at = Some(now);
        run.exit_code = Some(success.exit_code);
        run.output_path = success.output_path.clone();
        run.summary = success.summary.clone();
        if success.environment_id.is_some() {
            run.environment_id = success.environment_id.clone();
        }
        run.error_message = None;
        run.next_due_at = None;
        clear_lease(run);
        Ok(true)
    }

    async fn ack_run_failure(
        &self,
        run_id: &str,
        worker_id: &str,
        lease_token: Uuid,
        now: DateTime<Utc>,
        failure: &RunFailure,
    ) -> Result<bool> {
        let requeued = {
            let mut state = self.state();
            let Some(run) = state.runs.get_mut(run_id) else {
                return Ok(false);
            };
            if !owns_lease(run, worker_id, lease_token, now) {
                return Ok(false);
            }
            match failure.retry_at {
                Some(retry_at) => {
                    run.status = RunStatus::Queued;
                    run.next_due_at = Some(retry_at);
                    run.completed_at = None;
                }
                None => {
                    run.status = RunStatus::Failed;
                    run.next_due_at = None;
                    run.completed_at = Some(now);
                }
            }
            run.exit_code = failure.exit_code;
            run.error_message = Some(failure.error_message.clone());
            clear_lease(run);
            failure.retry_at.is_some()
        };
        if requeued {
            self.queue_notify.notify_one();
        }
        Ok(true)
    }

    async fn expire_run_leases(&self, now: DateTime<Utc>, retry: &RetryPolicy) -> Result<u64> {
        let mut swept = 0u64;
        let mut requeued = false;
        {
            let mut state = self.state();
            for run in state.runs.values_mut() {
                let expired = run.status == RunStatus::Running
                    && run.lease_expires_at.is_some_and(|expires| expires <= now);
                if !expired {
                    continue;
                }
                run.error_message =
                    Some(format!("Lease expired during attempt {}", run.attempt_count));
                match retry.retry_at(now, run.attempt_count, run.max_attempts) {
                    Some(retry_at) => {
                        run.status = RunStatus::Queued;
                        run.next_due_at = Some(retry_at);
                        requeued = true;
                    }
                    None => {
                        run.status = RunStatus::Failed;
                        run.completed_at = Some(now);
                    }
                }
                clear_lease(run);
                swept += 1;
            }
        }
        if requeued {
            self.queue_notify.notify_one();
        }
        Ok(swept)
    }

    async fn next_due_at(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .state()
            .runs
            .values()
            .filter(|run| run.status == RunStatus::Queued)
            .filter_map(|run| run.next_due_at)
            .filter(|due| *due > now)
            .min())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        Ok(self.run(run_id))
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<Document>> {
        Ok(self.state().documents.get(document_id).cloned())
    }

    async fn get_or_create_environment(
        &self,
        key: &EnvironmentKey,
        now: DateTime<Utc>,
    ) -> Result<Environment> {
        let mut state = self.state();
        if let Some(env) = state.environments.values().find(|env| env.key() == *key) {
            return Ok(env.clone());
        }
        let env = Environment {
            id: Uuid::new_v4().to_string(),
            workspace_id: key.workspace_id.clone(),
            configuration_id: key.configuration_id.clone(),
            engine_spec: key.engine_spec.clone(),
            dependency_digest: key.dependency_digest.clone(),
            status: EnvironmentStatus::Queued,
            build_generation: 0,
            python_interpreter: None,
            python_version: None,
            engine_version: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            last_used_at: None,
        };
        state.environments.insert(env.id.clone(), env.clone());
        Ok(env)
    }

    async fn get_environment(&self, environment_id: &str) -> Result<Option<Environment>> {
        Ok(self.state().environments.get(environment_id).cloned())
    }

    async fn mark_environment_building(
        &self,
        environment_id: &str,
        now: DateTime<Utc>,
    ) -> Result<i32> {
        let mut state = self.state();
        let env = state
            .environments
            .get_mut(environment_id)
            .ok_or_else(|| Error::Other(format!("Environment not found: {}", environment_id)))?;
        env.status = EnvironmentStatus::Building;
        env.build_generation += 1;
        env.error_message = None;
        env.updated_at = now;
        Ok(env.build_generation)
    }

    async fn mark_environment_ready(
        &self,
        environment_id: &str,
        metadata: &BuildMetadata,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(env) = self.state().environments.get_mut(environment_id) {
            env.status = EnvironmentStatus::Ready;
            env.python_interpreter = Some(metadata.python_interpreter.clone());
            env.python_version = Some(metadata.python_version.clone());
            env.engine_version = Some(metadata.engine_version.clone());
            env.error_message = None;
            env.updated_at = now;
        }
        Ok(())
    }

    async fn mark_environment_failed(
        &self,
        environment_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(env) = self.state().environments.get_mut(environment_id) {
            env.status = EnvironmentStatus::Failed;
            env.error_message = Some(error.to_string());
            env.updated_at = now;
        }
        Ok(())
    }

    async fn touch_environment(&self, environment_id: &str, now: DateTime<Utc>) -> Result<()> {
        if let Some(env) = self.state().environments.get_mut(environment_id) {
            env.last_used_at = Some(now);
        }
        Ok(())
    }

    async fn try_lock(&self, key: &str) -> Result<Option<Box<dyn EnvironmentLock>>> {
        if !lock_set(&self.locks).insert(key.to_string()) {
            return Ok(None);
        }
        Ok(Some(Box::new(MemoryLock {
            key: key.to_string(),
            locks: self.locks.clone(),
        })))
    }
}

struct MemoryLock {
    key: String,
    locks: Arc<Mutex<HashSet<String>>>,
}

#[async_trait]
impl EnvironmentLock for MemoryLock {
    fn key(&self) -> &str {
        &self.key
    }

    async fn release(self: Box<Self>) -> Result<()> {
        // Drop frees the key.
        Ok(())
    }
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        lock_set(&self.locks).remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_run(max_attempts: i32) -> (MemoryLeaseStore, String) {
        let store = MemoryLeaseStore::new();
        let id = store.enqueue_run(NewRun::new("ws", "cfg", "doc").with_max_attempts(max_attempts));
        (store, id)
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_until_expiry() {
        let (store, id) = store_with_run(3);
        let now = Utc::now();

        let first = store.claim_runs("a", now, 60, 10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].run_id, id);
        assert_eq!(first[0].attempt_count, 1);
        assert!(store.claim_runs("b", now, 60, 10).await.unwrap().is_empty());

        // Expired lease with attempts left is claimable again.
        let later = now + Duration::seconds(61);
        let second = store.claim_runs("b", later, 60, 10).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].attempt_count, 2);
        assert_ne!(second[0].lease_token, first[0].lease_token);
    }

    #[tokio::test]
    async fn test_not_due_runs_are_skipped() {
        let store = MemoryLeaseStore::new();
        let now = Utc::now();
        let mut run = NewRun::new("ws", "cfg", "doc");
        run.next_due_at = Some(now + Duration::seconds(30));
        store.enqueue_run(run);

        assert!(store.claim_runs("a", now, 60, 10).await.unwrap().is_empty());
        assert_eq!(
            store.next_due_at(now).await.unwrap(),
            Some(now + Duration::seconds(30))
        );
        assert_eq!(
            store
                .claim_runs("a", now + Duration::seconds(30), 60, 10)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_ack_requires_current_token() {
        let (store, id) = store_with_run(3);
        let now = Utc::now();
        let claim = store.claim_runs("a", now, 60, 1).await.unwrap().remove(0);

        let success = RunSuccess {
            exit_code: 0,
            ..Default::default()
        };
        assert!(
            !store
                .ack_run_success(&id, "a", Uuid::new_v4(), now, &success)
                .await
                .unwrap()
        );
        assert!(
            store
                .ack_run_success(&id, "a", claim.lease_token, now, &success)
                .await
                .unwrap()
        );
        assert!(
            !store
                .ack_run_success(&id, "a", claim.lease_token, now, &success)
                .await
                .unwrap()
        );
        assert_eq!(store.run(&id).unwrap().status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_expiry_requeues_then_fails() {
        let (store, id) = store_with_run(2);
        let policy = RetryPolicy::default();
        let now = Utc::now();

        store.claim_runs("a", now, 60, 1).await.unwrap();
        let t1 = now + Duration::seconds(61);
        assert_eq!(store.expire_run_leases(t1, &policy).await.unwrap(), 1);
        let run = store.run(&id).unwrap();
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.next_due_at, Some(t1 + Duration::seconds(5)));
        assert_eq!(run.attempt_count, 1);

        let t2 = t1 + Duration::seconds(5);
        store.claim_runs("a", t2, 60, 1).await.unwrap();
        let t3 = t2 + Duration::seconds(61);
        assert_eq!(store.expire_run_leases(t3, &policy).await.unwrap(), 1);
        let run = store.run(&id).unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_locks_are_exclusive_and_released_on_drop() {
        let store = MemoryLeaseStore::new();
        let lock = store.try_lock("k").await.unwrap().unwrap();
        assert!(store.try_lock("k").await.unwrap().is_none());
        assert!(store.try_lock("other").await.unwrap().is_some());
        lock.release().await.unwrap();
        assert!(!store.is_locked("k"));

        let dropped = store.try_lock("k").await.unwrap();
        drop(dropped);
        assert!(store.try_lock("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_heartbeat() {
        let (store, id) = store_with_run(3);
        let now = Utc::now();
        let claim = store.claim_runs("a", now, 60, 1).await.unwrap().remove(0);

        store.set_unreachable(true);
        assert!(
            store
                .heartbeat_run(&id, "a", claim.lease_token, now, 60)
                .await
                .is_err()
        );
    }
}
