// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! One run attempt, from claim to acknowledgement.
//!
//! ```text
//! start -> environment ready -> input staged -> engine executed
//!       -> result parsed -> persisted -> logs uploaded -> cleaned up
//! ```
//!
//! Any step may fail into [`RunProcessor::handle_run_failure`]. Lease loss
//! is not a failure: the attempt is abandoned without further writes. The
//! per-run working directory is removed on every path.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use tracing::{debug, error, info, warn};

use crate::environment::EnvironmentManager;
use crate::error::{Error, Result};
use crate::event_log::EventLog;
use crate::lease::RunLease;
use crate::models::{Run, RunClaim, RunFailure, RunSuccess};
use crate::paths::DataLayout;
use crate::retry::RetryPolicy;
use crate::run_options::RunOptions;
use crate::storage::ArtifactStorage;
use crate::store::LeaseStore;
use crate::subprocess::{CommandSpec, SubprocessRunner, Supervision};

/// Structured event the engine emits once it has produced its output.
pub const ENGINE_COMPLETED_EVENT: &str = "engine.run.completed";

/// Run processor settings.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Identity written into leases.
    pub worker_id: String,
    /// Lease duration granted by heartbeats.
    pub lease_seconds: i64,
    /// Interval between heartbeats.
    pub heartbeat_interval: Duration,
    /// Engine wall-clock budget.
    pub run_timeout: Duration,
    /// Engine module run as `python -m <module>`.
    pub engine_module: String,
    /// Backoff for failed attempts.
    pub retry: RetryPolicy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker".to_string(),
            lease_seconds: 900,
            heartbeat_interval: Duration::from_secs(30),
            run_timeout: Duration::from_secs(600),
            engine_module: "extract_engine".to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Acknowledged as succeeded.
    Succeeded,
    /// Failed and requeued.
    RetryScheduled(DateTime<Utc>),
    /// Failed terminally.
    Failed,
    /// The lease was lost; nothing was written for this attempt.
    Abandoned,
}

/// Executes claimed runs.
pub struct RunProcessor {
    store: Arc<dyn LeaseStore>,
    storage: Arc<dyn ArtifactStorage>,
    environments: EnvironmentManager,
    runner: SubprocessRunner,
    layout: DataLayout,
    config: ProcessorConfig,
}

impl RunProcessor {
    /// Create a processor.
    pub fn new(
        store: Arc<dyn LeaseStore>,
        storage: Arc<dyn ArtifactStorage>,
        environments: EnvironmentManager,
        runner: SubprocessRunner,
        layout: DataLayout,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            store,
            storage,
            environments,
            runner,
            layout,
            config,
        }
    }

    /// Process one claimed run to an acknowledged outcome.
    ///
    /// Errors are infrastructure failures while acknowledging; the lease then
    /// expires and the maintenance sweep recovers the run.
    pub async fn process(&self, claim: RunClaim) -> Result<RunOutcome> {
        let lease = RunLease::new(
            self.store.clone(),
            self.config.worker_id.clone(),
            claim,
            self.config.lease_seconds,
            self.config.heartbeat_interval,
        );
        let work_dir = self.layout.run_work_dir(lease.run_id());
        info!(
            run_id = %lease.run_id(),
            attempt = lease.claim().attempt_count,
            max_attempts = lease.claim().max_attempts,
            "Processing run"
        );

        let outcome = match self.open_attempt(&lease, &work_dir).await {
            Ok(log) => {
                let mut run = None;
                let result = self.execute(&lease, &work_dir, &log, &mut run).await;
                match result {
                    Ok(outcome) => Ok(outcome),
                    Err(e) => {
                        self.handle_run_failure(&lease, e, Some(&log), run.as_ref())
                            .await
                    }
                }
            }
            Err(e) => self.handle_run_failure(&lease, e, None, None).await,
        };

        if let Err(e) = remove_dir_if_exists(&work_dir).await {
            warn!(run_id = %lease.run_id(), path = %work_dir.display(), error = %e, "Failed to remove run working directory");
        }
        outcome
    }

    async fn open_attempt(&self, lease: &RunLease, work_dir: &Path) -> Result<EventLog> {
        remove_dir_if_exists(work_dir).await?;
        tokio::fs::create_dir_all(work_dir).await?;
        Ok(EventLog::create(
            work_dir.join("logs").join("events.ndjson"),
            json!({
                "run_id": lease.run_id(),
                "attempt": lease.claim().attempt_count,
                "worker_id": self.config.worker_id,
            }),
        )?)
    }

    async fn execute(
        &self,
        lease: &RunLease,
        work_dir: &Path,
        log: &EventLog,
        loaded: &mut Option<Run>,
    ) -> Result<RunOutcome> {
        let run = self
            .store
            .get_run(lease.run_id())
            .await?
            .ok_or_else(|| Error::RunNotFound(lease.run_id().to_string()))?;
        let run = loaded.insert(run);
        let attempt = lease.claim().attempt_count;
        let options = RunOptions::from_value(&run.run_options)?;

        if options.dry_run {
            log.info(
                "run.completed",
                "Dry run completed without invoking the engine",
                json!({ "dry_run": true, "exit_code": 0 }),
            );
            return self
                .finish(lease, run, attempt, log, RunSuccess::default())
                .await;
        }

        log.info(
            "run.started",
            "Run started",
            json!({
                "attempt": attempt,
                "max_attempts": lease.claim().max_attempts,
                "configuration_id": run.configuration_id,
                "input_document_id": run.input_document_id,
            }),
        );

        let ready = self.environments.ensure_ready(run, lease, log).await?;
        lease.ensure_held()?;

        if options.validate_only {
            log.info(
                "run.completed",
                "Configuration validated",
                json!({
                    "validate_only": true,
                    "exit_code": 0,
                    "environment_id": ready.environment.id,
                }),
            );
            let success = RunSuccess {
                environment_id: Some(ready.environment.id.clone()),
                ..Default::default()
            };
            return self.finish(lease, run, attempt, log, success).await;
        }

        let input = self.stage_input(run, work_dir, log).await?;
        let output_dir = work_dir.join("output");
        tokio::fs::create_dir_all(&output_dir).await?;
        let configuration_dir = self
            .layout
            .configuration_dir(&run.workspace_id, &run.configuration_id);

        let command = CommandSpec::new(&ready.python)
            .args(["-m", self.config.engine_module.as_str(), "run"])
            .arg("--input")
            .arg(&input)
            .arg("--output-dir")
            .arg(&output_dir)
            .arg("--config-package")
            .arg(&configuration_dir)
            .args(["--log-format", "ndjson"])
            .args(options.engine_flags())
            .current_dir(work_dir)
            .env("PYTHONUNBUFFERED", "1");

        log.info(
            "engine.started",
            "Engine started",
            json!({ "command": command.display() }),
        );

        let completion: Mutex<Option<Map<String, Value>>> = Mutex::new(None);
        let capture = |event: &Map<String, Value>| {
            if event.get("event").and_then(Value::as_str) == Some(ENGINE_COMPLETED_EVENT)
                && let Ok(mut slot) = completion.lock()
            {
                *slot = Some(event.clone());
            }
        };

        let outcome = self
            .runner
            .run(
                &command,
                Supervision {
                    timeout: self.config.run_timeout,
                    heartbeat: Some(lease),
                    heartbeat_interval: self.config.heartbeat_interval,
                    on_event: Some(&capture),
                    log,
                },
            )
            .await?;

        log.info(
            "engine.finished",
            format!("Engine exited with code {}", outcome.exit_code),
            json!({
                "exit_code": outcome.exit_code,
                "timed_out": outcome.timed_out,
                "duration_ms": outcome.duration.as_millis() as u64,
            }),
        );

        if outcome.timed_out {
            return Err(Error::EngineTimedOut(self.config.run_timeout.as_secs()));
        }
        if outcome.exit_code != 0 {
            return Err(Error::EngineFailed(outcome.exit_code));
        }

        let event = completion.into_inner().ok().flatten().ok_or_else(|| {
            Error::EngineResult(format!("engine did not emit {}", ENGINE_COMPLETED_EVENT))
        })?;
        let result = EngineResult::from_event(&event, &output_dir)?;
        if !tokio::fs::try_exists(&result.artifact).await.unwrap_or(false) {
            return Err(Error::EngineResult(format!(
                "output artifact not found: {}",
                result.artifact.display()
            )));
        }

        lease.confirm().await?;
        let output_path = self.storage.store_output(run, &result.artifact).await?;

        log.info(
            "run.completed",
            "Run completed",
            json!({
                "exit_code": 0,
                "output_path": output_path,
                "summary": result.summary,
            }),
        );

        let success = RunSuccess {
            exit_code: 0,
            output_path: Some(output_path),
            summary: Some(result.summary),
            environment_id: Some(ready.environment.id.clone()),
        };
        self.finish(lease, run, attempt, log, success).await
    }

    /// Upload the log, then acknowledge success.
    ///
    /// The lease is renewed first; the ack itself is conditioned on it.
    async fn finish(
        &self,
        lease: &RunLease,
        run: &Run,
        attempt: i32,
        log: &EventLog,
        success: RunSuccess,
    ) -> Result<RunOutcome> {
        lease.confirm().await?;
        self.storage.store_logs(run, attempt, log.path()).await?;

        if lease.ack_success(&success).await? {
            info!(run_id = %run.id, attempt, "Run succeeded");
            Ok(RunOutcome::Succeeded)
        } else {
            warn!(run_id = %run.id, "Lease lost before success could be recorded");
            Ok(RunOutcome::Abandoned)
        }
    }

    async fn stage_input(&self, run: &Run, work_dir: &Path, log: &EventLog) -> Result<PathBuf> {
        let document = self
            .store
            .get_document(&run.input_document_id)
            .await?
            .ok_or_else(|| Error::DocumentUnavailable(run.input_document_id.clone()))?;
        if document.deleted_at.is_some() {
            return Err(Error::DocumentUnavailable(format!(
                "{} (deleted)",
                document.id
            )));
        }
        let source = self.storage.document_path(&document).await?;

        let file_name = Path::new(&document.original_filename)
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| document.id.clone().into());
        let input_dir = work_dir.join("input");
        tokio::fs::create_dir_all(&input_dir).await?;
        let staged = input_dir.join(file_name);
        let bytes = tokio::fs::copy(&source, &staged).await?;

        log.info(
            "input.staged",
            "Input document staged",
            json!({
                "document_id": document.id,
                "path": staged.display().to_string(),
                "bytes": bytes,
            }),
        );
        Ok(staged)
    }

    /// Record a failed attempt: requeue with backoff or fail terminally.
    /// Non-retryable errors fail terminally regardless of remaining attempts.
    ///
    /// Returns [`RunOutcome::Abandoned`] without writing anything when the
    /// lease is already lost.
    pub async fn handle_run_failure(
        &self,
        lease: &RunLease,
        error: Error,
        log: Option<&EventLog>,
        run: Option<&Run>,
    ) -> Result<RunOutcome> {
        if error.is_lease_lost() || lease.is_lost() {
            warn!(run_id = %lease.run_id(), error = %error, "Lease lost, abandoning attempt");
            return Ok(RunOutcome::Abandoned);
        }

        let claim = lease.claim();
        let retry_at = if error.is_retryable() {
            self.config
                .retry
                .retry_at(Utc::now(), claim.attempt_count, claim.max_attempts)
        } else {
            None
        };
        let failure = RunFailure {
            exit_code: error.exit_code(),
            error_message: error.to_string(),
            retry_at,
        };

        if !lease.ack_failure(&failure).await? {
            warn!(run_id = %lease.run_id(), error = %error, "Lease lost before failure could be recorded");
            return Ok(RunOutcome::Abandoned);
        }

        match retry_at {
            Some(retry_at) => {
                if let Some(log) = log {
                    log.warning(
                        "run.retry_scheduled",
                        format!("Attempt {} failed: {}", claim.attempt_count, error),
                        json!({
                            "attempt": claim.attempt_count,
                            "max_attempts": claim.max_attempts,
                            "exit_code": failure.exit_code,
                            "retry_at": retry_at.to_rfc3339(),
                        }),
                    );
                }
                warn!(
                    run_id = %lease.run_id(),
                    attempt = claim.attempt_count,
                    retry_at = %retry_at,
                    error = %error,
                    "Run attempt failed, retry scheduled"
                );
                Ok(RunOutcome::RetryScheduled(retry_at))
            }
            None => {
                error!(
                    run_id = %lease.run_id(),
                    attempt = claim.attempt_count,
                    error = %error,
                    "Run failed"
                );
                if let Some(log) = log {
                    log.error(
                        "run.failed",
                        format!("Run failed: {}", error),
                        json!({
                            "attempt": claim.attempt_count,
                            "exit_code": failure.exit_code,
                        }),
                    );
                    if let Some(run) = run
                        && let Err(e) = self
                            .storage
                            .store_logs(run, claim.attempt_count, log.path())
                            .await
                    {
                        warn!(run_id = %run.id, error = %e, "Failed to upload run log");
                    }
                }
                Ok(RunOutcome::Failed)
            }
        }
    }
}

/// Parsed `engine.run.completed` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineResult {
    /// Normalized output artifact.
    pub artifact: PathBuf,
    /// Metrics, fields and columns reported by the engine.
    pub summary: Value,
}

impl EngineResult {
    /// Interpret a completion event; relative artifact paths resolve against `output_dir`.
    pub fn from_event(event: &Map<String, Value>, output_dir: &Path) -> Result<Self> {
        let payload = match event.get("data") {
            Some(Value::Object(data)) => data,
            _ => event,
        };

        let path = payload
            .get("outputs")
            .and_then(|outputs| outputs.get("normalized"))
            .and_then(|normalized| normalized.get("path"))
            .and_then(Value::as_str)
            .filter(|path| !path.is_empty())
            .ok_or_else(|| {
                Error::EngineResult("completion event lacks outputs.normalized.path".to_string())
            })?;
        let path = Path::new(path);
        let artifact = if path.is_absolute() {
            path.to_path_buf()
        } else {
            output_dir.join(path)
        };

        let section = |name: &str| payload.get(name).cloned().unwrap_or(Value::Null);
        let summary = json!({
            "metrics": section("metrics"),
            "fields": section("fields"),
            "columns": section("columns"),
        });
        debug!(artifact = %artifact.display(), "Parsed engine completion");

        Ok(Self { artifact, summary })
    }
}

async fn remove_dir_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
