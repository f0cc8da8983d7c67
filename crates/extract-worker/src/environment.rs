// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Environment readiness with fleet-wide build deduplication.
//!
//! The cache-hit path takes no lock. Otherwise the run waits for the
//! environment's advisory lock while still heartbeating its own lease,
//! re-checks the status once the lock is held, and builds only if no other
//! worker finished first. The lock is released on every path.
//!
//! Build failures are observed through `build_generation`: a waiter that finds
//! `failed` after waiting fails too, unless that exact failed generation was
//! already visible before it waited. One failed build is therefore not
//! immediately retried by every waiter, while a stale failure is rebuilt.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::env_builder::{BuildSupervision, EnvironmentBuilder};
use crate::error::{Error, Result};
use crate::event_log::EventLog;
use crate::lease::RunLease;
use crate::models::{Environment, EnvironmentStatus, Run};
use crate::paths::{DataLayout, venv_python};
use crate::store::{EnvironmentLock, LeaseStore};

/// Environment manager settings.
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    /// Overall build deadline.
    pub build_timeout: Duration,
    /// Poll interval while another worker holds the build lock.
    pub lock_poll_interval: Duration,
    /// Heartbeat interval of the waiting or building run.
    pub heartbeat_interval: Duration,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            build_timeout: Duration::from_secs(900),
            lock_poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// A ready environment resolved for one run.
#[derive(Debug, Clone)]
pub struct ReadyEnvironment {
    /// Environment record.
    pub environment: Environment,
    /// Interpreter to run the engine with.
    pub python: PathBuf,
}

/// Ensures environments are built exactly once and shared afterwards.
pub struct EnvironmentManager {
    store: Arc<dyn LeaseStore>,
    builder: EnvironmentBuilder,
    layout: DataLayout,
    config: EnvironmentConfig,
}

impl EnvironmentManager {
    /// Create a manager.
    pub fn new(
        store: Arc<dyn LeaseStore>,
        builder: EnvironmentBuilder,
        layout: DataLayout,
        config: EnvironmentConfig,
    ) -> Self {
        Self {
            store,
            builder,
            layout,
            config,
        }
    }

    /// Return the run's environment, building it if needed.
    pub async fn ensure_ready(
        &self,
        run: &Run,
        lease: &RunLease,
        log: &EventLog,
    ) -> Result<ReadyEnvironment> {
        let key = run.environment_key();
        let environment = self
            .store
            .get_or_create_environment(&key, Utc::now())
            .await?;

        if environment.status == EnvironmentStatus::Ready {
            return self.resolve_ready(environment, log).await;
        }

        let known_failure = (environment.status == EnvironmentStatus::Failed)
            .then_some(environment.build_generation);
        let lock_key = key.lock_key();
        let lock = self.acquire_lock(&lock_key, lease, log).await?;

        let result = self
            .build_locked(&environment.id, known_failure, lease, log)
            .await;

        if let Err(e) = lock.release().await {
            warn!(lock_key = %lock_key, error = %e, "Failed to release environment lock");
        }
        result
    }

    /// Poll for the lock, heartbeating the lease on its own schedule.
    async fn acquire_lock(
        &self,
        lock_key: &str,
        lease: &RunLease,
        log: &EventLog,
    ) -> Result<Box<dyn EnvironmentLock>> {
        let mut waiting_logged = false;

        loop {
            lease.ensure_held()?;
            if let Some(lock) = self.store.try_lock(lock_key).await? {
                debug!(run_id = %lease.run_id(), lock_key = %lock_key, "Environment lock acquired");
                return Ok(lock);
            }

            if !waiting_logged {
                log.info(
                    "environment.waiting",
                    "Waiting for another worker to finish the environment build",
                    json!({ "lock_key": lock_key }),
                );
                waiting_logged = true;
            }

            let wake = (Instant::now() + self.config.lock_poll_interval).min(lease.next_beat_at());
            tokio::time::sleep_until(wake).await;

            if !lease.renew_if_due().await {
                return Err(Error::LeaseLost(lease.run_id().to_string()));
            }
        }
    }

    async fn build_locked(
        &self,
        environment_id: &str,
        known_failure: Option<i32>,
        lease: &RunLease,
        log: &EventLog,
    ) -> Result<ReadyEnvironment> {
        let current = self
            .store
            .get_environment(environment_id)
            .await?
            .ok_or_else(|| Error::EnvironmentMissing(environment_id.to_string()))?;

        match current.status {
            EnvironmentStatus::Ready => return self.resolve_ready(current, log).await,
            EnvironmentStatus::Failed if known_failure != Some(current.build_generation) => {
                let reason = current
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string());
                return Err(Error::EnvironmentBuild(format!(
                    "concurrent build of environment {} failed: {}",
                    environment_id, reason
                )));
            }
            _ => {}
        }

        lease.ensure_held()?;
        let generation = self
            .store
            .mark_environment_building(environment_id, Utc::now())
            .await?;
        let building = Environment {
            status: EnvironmentStatus::Building,
            build_generation: generation,
            ..current
        };

        log.info(
            "environment.building",
            "Building environment",
            json!({ "environment_id": environment_id, "build_generation": generation }),
        );

        let build_log = self.builder.open_log(&building)?;
        let built = self
            .builder
            .build(
                &building,
                BuildSupervision {
                    heartbeat: Some(lease),
                    heartbeat_interval: self.config.heartbeat_interval,
                    timeout: self.config.build_timeout,
                },
                &build_log,
            )
            .await;

        match built {
            Ok(metadata) => {
                self.store
                    .mark_environment_ready(environment_id, &metadata, Utc::now())
                    .await?;
                let ready = self
                    .store
                    .get_environment(environment_id)
                    .await?
                    .ok_or_else(|| Error::EnvironmentMissing(environment_id.to_string()))?;
                self.resolve_ready(ready, log).await
            }
            Err(e) => {
                if let Err(mark_err) = self
                    .store
                    .mark_environment_failed(environment_id, &e.to_string(), Utc::now())
                    .await
                {
                    warn!(environment_id = %environment_id, error = %mark_err, "Failed to record build failure");
                }
                Err(if e.is_lease_lost() {
                    e
                } else {
                    Error::EnvironmentBuild(e.to_string())
                })
            }
        }
    }

    async fn resolve_ready(&self, environment: Environment, log: &EventLog) -> Result<ReadyEnvironment> {
        let python = environment
            .python_interpreter
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| venv_python(&self.layout.venv_dir(&environment)));

        if !tokio::fs::try_exists(&python).await.unwrap_or(false) {
            // Requeue the build for the next run rather than leave a broken `ready`.
            self.store
                .mark_environment_failed(
                    &environment.id,
                    &format!("interpreter missing: {}", python.display()),
                    Utc::now(),
                )
                .await?;
            return Err(Error::EnvironmentMissing(format!(
                "{} (interpreter {} not found)",
                environment.id,
                python.display()
            )));
        }

        self.store
            .touch_environment(&environment.id, Utc::now())
            .await?;
        log.info(
            "environment.ready",
            "Environment ready",
            json!({
                "environment_id": environment.id,
                "python_interpreter": python.display().to_string(),
                "python_version": environment.python_version,
                "engine_version": environment.engine_version,
            }),
        );
        info!(environment_id = %environment.id, "Using environment");

        Ok(ReadyEnvironment {
            environment,
            python,
        })
    }
}
