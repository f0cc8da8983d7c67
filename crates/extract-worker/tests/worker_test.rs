// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker loop tests through the embeddable runtime.
//!
//! Run with:
//! ```bash
//! cargo test -p extract-worker --test worker_test
//! ```

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use common::{CONFIGURATION, Harness, WORKSPACE};
use extract_worker::listener::NotifyListener;
use extract_worker::models::{NewRun, RunStatus};
use extract_worker::retry::RetryPolicy;
use extract_worker::runtime::{WorkerRuntime, WorkerRuntimeBuilder};
use extract_worker::store::MemoryLeaseStore;

fn builder(harness: &Harness, store: &Arc<MemoryLeaseStore>) -> WorkerRuntimeBuilder {
    WorkerRuntime::builder()
        .store(store.clone())
        .listener(Box::new(NotifyListener::new(store.queue_notify())))
        .worker_id("worker-loop")
        .data_dir(harness.data_dir())
        .python_bin(&harness.python)
        .concurrency(2)
        .lease_duration(Duration::from_secs(60))
        .heartbeat_interval(Duration::from_millis(200))
        .listen_timeout(Duration::from_secs(60))
        .env_lock_poll_interval(Duration::from_millis(20))
        .kill_grace(Duration::from_millis(500))
        .jitter_max(Duration::from_millis(10))
}

fn status(store: &MemoryLeaseStore, run_id: &str) -> RunStatus {
    store.run(run_id).unwrap().status
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_processes_queued_runs() {
    let harness = Harness::new();
    let store = Arc::new(MemoryLeaseStore::new());
    let runtime = builder(&harness, &store).build().unwrap().start().await.unwrap();

    let run_ids: Vec<String> = (0..3)
        .map(|_| harness.seed_run(&store, json!({})))
        .collect();

    let done = common::wait_until(Duration::from_secs(30), || {
        run_ids
            .iter()
            .all(|id| status(&store, id) == RunStatus::Succeeded)
    })
    .await;
    assert!(done, "runs did not complete");
    assert_eq!(harness.log_lines("pip.log"), 2);
    assert_eq!(harness.log_lines("engine.log"), 3);

    runtime.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delayed_run_is_picked_up_without_notification() {
    let harness = Harness::new();
    let store = Arc::new(MemoryLeaseStore::new());
    let runtime = builder(&harness, &store).build().unwrap().start().await.unwrap();

    let document = harness.document();
    let mut run = NewRun::new(WORKSPACE, CONFIGURATION, &document.id)
        .with_options(json!({"dry_run": true}));
    run.next_due_at = Some(Utc::now() + chrono::Duration::milliseconds(500));
    store.insert_document(document);
    let run_id = store.enqueue_run(run);

    // The enqueue notification arrives before the run is due; the loop must
    // wake again on its own once it is.
    assert!(
        common::wait_until(Duration::from_secs(10), || {
            status(&store, &run_id) == RunStatus::Succeeded
        })
        .await,
        "delayed run was not picked up"
    );

    runtime.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_run_is_retried_until_success() {
    let harness = Harness::new();
    harness.set_control("engine_exit_code", "3");
    let store = Arc::new(MemoryLeaseStore::new());
    let runtime = builder(&harness, &store)
        .retry(RetryPolicy::new(
            Duration::from_millis(300),
            Duration::from_secs(1),
        ))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    let run_id = harness.seed_run(&store, json!({}));
    assert!(
        common::wait_until(Duration::from_secs(20), || {
            store.run(&run_id).unwrap().attempt_count >= 1
                && status(&store, &run_id) == RunStatus::Queued
        })
        .await
    );
    harness.clear_control("engine_exit_code");

    assert!(
        common::wait_until(Duration::from_secs(20), || {
            status(&store, &run_id) == RunStatus::Succeeded
        })
        .await
    );
    assert!(store.run(&run_id).unwrap().attempt_count >= 2);

    runtime.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sweep_recovers_abandoned_lease() {
    let harness = Harness::new();
    let store = Arc::new(MemoryLeaseStore::new());

    // A run claimed by a worker that vanished.
    let run_id = harness.seed_run(&store, json!({"dry_run": true}));
    {
        use extract_worker::store::LeaseStore;
        store
            .claim_runs("vanished", Utc::now(), 60, 1)
            .await
            .unwrap();
    }
    store.expire_lease(&run_id);

    let runtime = builder(&harness, &store)
        .maintenance_interval(Duration::from_millis(100))
        .retry(RetryPolicy::new(
            Duration::from_millis(100),
            Duration::from_secs(1),
        ))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    assert!(
        common::wait_until(Duration::from_secs(10), || {
            status(&store, &run_id) == RunStatus::Succeeded
        })
        .await
    );
    let run = store.run(&run_id).unwrap();
    assert_eq!(run.attempt_count, 2);

    runtime.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_abandons_runs_past_grace() {
    let harness = Harness::new();
    harness.set_control("engine_sleep", "");
    let store = Arc::new(MemoryLeaseStore::new());
    let runtime = builder(&harness, &store)
        .shutdown_grace(Duration::from_millis(200))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    let run_id = harness.seed_run(&store, json!({}));
    assert!(common::wait_until(Duration::from_secs(15), || harness.engine_pid().is_some()).await);

    tokio::time::timeout(Duration::from_secs(10), runtime.shutdown())
        .await
        .expect("shutdown hung")
        .unwrap();

    // Never acknowledged; the lease is left for the sweep.
    assert_eq!(status(&store, &run_id), RunStatus::Running);
}
