// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for extract-worker.
//!
//! [`WorkerRuntime`] wires the lease store, artifact storage, environment
//! manager and run processor into a [`Worker`] and runs it on a background
//! task, so the worker can live inside an existing tokio application.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use extract_worker::listener::PgQueueListener;
//! use extract_worker::runtime::WorkerRuntime;
//! use extract_worker::store::PgLeaseStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::PgPool::connect("postgres://...").await?;
//!     let listener = PgQueueListener::connect(pool.clone(), "run_queued").await?;
//!
//!     let runtime = WorkerRuntime::builder()
//!         .store(Arc::new(PgLeaseStore::new(pool)))
//!         .listener(Box::new(listener))
//!         .data_dir("/var/lib/extract")
//!         .concurrency(4)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Config;
use crate::env_builder::EnvironmentBuilder;
use crate::environment::{EnvironmentConfig, EnvironmentManager};
use crate::listener::{PollingListener, QueueListener};
use crate::paths::DataLayout;
use crate::processor::{ProcessorConfig, RunProcessor};
use crate::retry::RetryPolicy;
use crate::storage::{ArtifactStorage, FsArtifactStorage};
use crate::store::LeaseStore;
use crate::subprocess::SubprocessRunner;
use crate::worker::{Worker, WorkerConfig};

/// Builder for creating a [`WorkerRuntime`].
pub struct WorkerRuntimeBuilder {
    store: Option<Arc<dyn LeaseStore>>,
    storage: Option<Arc<dyn ArtifactStorage>>,
    listener: Option<Box<dyn QueueListener>>,
    worker_id: String,
    concurrency: usize,
    claim_batch_size: Option<usize>,
    lease_duration: Duration,
    heartbeat_interval: Duration,
    listen_timeout: Duration,
    maintenance_interval: Duration,
    retry: RetryPolicy,
    run_timeout: Duration,
    env_build_timeout: Duration,
    env_lock_poll_interval: Duration,
    kill_grace: Duration,
    shutdown_grace: Duration,
    jitter_max: Duration,
    data_dir: PathBuf,
    python_bin: PathBuf,
    engine_module: String,
}

impl Default for WorkerRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            storage: None,
            listener: None,
            worker_id: format!("worker-{}", std::process::id()),
            concurrency: 2,
            claim_batch_size: None,
            lease_duration: Duration::from_secs(900), // 15 minutes
            heartbeat_interval: Duration::from_secs(30),
            listen_timeout: Duration::from_secs(60),
            maintenance_interval: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            run_timeout: Duration::from_secs(600),
            env_build_timeout: Duration::from_secs(900),
            env_lock_poll_interval: Duration::from_secs(1),
            kill_grace: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(30),
            jitter_max: Duration::from_millis(250),
            data_dir: PathBuf::from(".data"),
            python_bin: PathBuf::from("python3"),
            engine_module: "extract_engine".to_string(),
        }
    }
}

impl WorkerRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply every setting carried by a loaded [`Config`].
    pub fn config(self, config: &Config) -> Self {
        self.worker_id(config.worker_id.clone())
            .concurrency(config.concurrency)
            .claim_batch_size(config.claim_batch_size)
            .lease_duration(config.lease_duration)
            .heartbeat_interval(config.heartbeat_interval)
            .listen_timeout(config.listen_timeout)
            .maintenance_interval(config.maintenance_interval)
            .retry(config.retry)
            .run_timeout(config.run_timeout)
            .env_build_timeout(config.env_build_timeout)
            .env_lock_poll_interval(config.env_lock_poll_interval)
            .shutdown_grace(config.shutdown_grace)
            .data_dir(config.data_dir.clone())
            .python_bin(config.python_bin.clone())
            .engine_module(config.engine_module.clone())
    }

    /// Set the lease store (required).
    pub fn store(mut self, store: Arc<dyn LeaseStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the artifact storage.
    ///
    /// Default: [`FsArtifactStorage`] under the data directory
    pub fn storage(mut self, storage: Arc<dyn ArtifactStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set the queue listener.
    ///
    /// Default: [`PollingListener`]
    pub fn listener(mut self, listener: Box<dyn QueueListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Set the identity written into leases.
    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Set the number of runs executed in parallel.
    ///
    /// Default: 2
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the maximum runs claimed per query.
    ///
    /// Default: the concurrency
    pub fn claim_batch_size(mut self, size: usize) -> Self {
        self.claim_batch_size = Some(size);
        self
    }

    /// Set the lease duration.
    ///
    /// Default: 15 minutes
    pub fn lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    /// Set the heartbeat interval.
    ///
    /// Default: 30 seconds
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the longest wait on the queue listener.
    ///
    /// Default: 60 seconds
    pub fn listen_timeout(mut self, timeout: Duration) -> Self {
        self.listen_timeout = timeout;
        self
    }

    /// Set the lease-expiry sweep period.
    ///
    /// Default: 30 seconds
    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// Set the retry backoff.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the engine wall-clock budget.
    ///
    /// Default: 10 minutes
    pub fn run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }

    /// Set the environment build budget.
    ///
    /// Default: 15 minutes
    pub fn env_build_timeout(mut self, timeout: Duration) -> Self {
        self.env_build_timeout = timeout;
        self
    }

    /// Set the poll interval while waiting for a build lock.
    ///
    /// Default: 1 second
    pub fn env_lock_poll_interval(mut self, interval: Duration) -> Self {
        self.env_lock_poll_interval = interval;
        self
    }

    /// Set the delay between SIGTERM and SIGKILL when stopping a subprocess.
    ///
    /// Default: 5 seconds
    pub fn kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Set how long shutdown waits for in-flight runs.
    ///
    /// Default: 30 seconds
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Set the upper bound of the random delay after a queue notification.
    ///
    /// Default: 250 milliseconds
    pub fn jitter_max(mut self, jitter: Duration) -> Self {
        self.jitter_max = jitter;
        self
    }

    /// Set the data directory for environments, work directories and artifacts.
    ///
    /// Default: `.data`
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = path.into();
        self
    }

    /// Set the interpreter used to create environments.
    ///
    /// Default: `python3`
    pub fn python_bin(mut self, path: impl Into<PathBuf>) -> Self {
        self.python_bin = path.into();
        self
    }

    /// Set the engine module run as `python -m <module>`.
    ///
    /// Default: `extract_engine`
    pub fn engine_module(mut self, module: impl Into<String>) -> Self {
        self.engine_module = module.into();
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing or settings are inconsistent.
    pub fn build(self) -> Result<WorkerRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        if self.concurrency == 0 {
            anyhow::bail!("concurrency must be at least 1");
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval >= self.lease_duration {
            anyhow::bail!("heartbeat_interval must be positive and shorter than lease_duration");
        }

        let layout = DataLayout::new(self.data_dir);
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(FsArtifactStorage::new(layout.clone())));
        let listener = self
            .listener
            .unwrap_or_else(|| Box::new(PollingListener));
        let lease_seconds = self.lease_duration.as_secs() as i64;

        Ok(WorkerRuntimeConfig {
            store,
            storage,
            listener,
            layout,
            worker: WorkerConfig {
                worker_id: self.worker_id.clone(),
                concurrency: self.concurrency,
                claim_batch_size: self.claim_batch_size.unwrap_or(self.concurrency).max(1),
                lease_seconds,
                listen_timeout: self.listen_timeout,
                maintenance_interval: self.maintenance_interval,
                retry: self.retry,
                shutdown_grace: self.shutdown_grace,
                jitter_max: self.jitter_max,
            },
            processor: ProcessorConfig {
                worker_id: self.worker_id,
                lease_seconds,
                heartbeat_interval: self.heartbeat_interval,
                run_timeout: self.run_timeout,
                engine_module: self.engine_module,
                retry: self.retry,
            },
            environment: EnvironmentConfig {
                build_timeout: self.env_build_timeout,
                lock_poll_interval: self.env_lock_poll_interval,
                heartbeat_interval: self.heartbeat_interval,
            },
            python_bin: self.python_bin,
            kill_grace: self.kill_grace,
        })
    }
}

/// Configuration for a [`WorkerRuntime`].
pub struct WorkerRuntimeConfig {
    store: Arc<dyn LeaseStore>,
    storage: Arc<dyn ArtifactStorage>,
    listener: Box<dyn QueueListener>,
    layout: DataLayout,
    worker: WorkerConfig,
    processor: ProcessorConfig,
    environment: EnvironmentConfig,
    python_bin: PathBuf,
    kill_grace: Duration,
}

impl WorkerRuntimeConfig {
    /// Start the runtime, spawning the worker loop.
    pub async fn start(self) -> Result<WorkerRuntime> {
        tokio::fs::create_dir_all(self.layout.data_dir()).await?;

        let runner = SubprocessRunner::new(self.kill_grace);
        let builder = EnvironmentBuilder::new(self.layout.clone(), self.python_bin, runner.clone());
        let environments = EnvironmentManager::new(
            self.store.clone(),
            builder,
            self.layout.clone(),
            self.environment,
        );
        let processor = Arc::new(RunProcessor::new(
            self.store.clone(),
            self.storage,
            environments,
            runner,
            self.layout.clone(),
            self.processor,
        ));

        let worker_id = self.worker.worker_id.clone();
        let concurrency = self.worker.concurrency;
        let worker = Worker::new(self.store, processor, self.listener, self.worker);
        let shutdown = worker.shutdown_handle();
        let handle = tokio::spawn(worker.run());

        info!(
            worker_id = %worker_id,
            concurrency,
            data_dir = %self.layout.data_dir().display(),
            "WorkerRuntime started"
        );

        Ok(WorkerRuntime {
            handle,
            shutdown,
            worker_id,
        })
    }
}

/// A running worker that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination: no new runs
/// are claimed and in-flight runs get the configured grace period.
pub struct WorkerRuntime {
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
    worker_id: String,
}

impl WorkerRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> WorkerRuntimeBuilder {
        WorkerRuntimeBuilder::new()
    }

    /// Identity this runtime writes into leases.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Check if the worker loop is still running.
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Gracefully shut down the runtime.
    pub async fn shutdown(self) -> Result<()> {
        info!("WorkerRuntime shutting down...");
        self.shutdown.notify_one();

        match self.handle.await {
            Ok(()) => {
                info!("WorkerRuntime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("Worker task panicked: {}", e);
                Err(anyhow::anyhow!("worker task panicked: {}", e))
            }
        }
    }
}
