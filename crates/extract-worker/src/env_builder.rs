// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Environment build recipe.
//!
//! Steps, each logged and exit-checked:
//!
//! 1. `create_venv`: `<python> -m venv <env>/venv` (the directory is recreated from scratch)
//! 2. `install_engine`: `<venv python> -m pip install <engine_spec>`
//! 3. `install_configuration`: `<venv python> -m pip install -e <configuration dir>`
//! 4. `probe_versions`: prints an `environment.versions` event with interpreter and engine versions
//!
//! Every step gets the remaining share of one overall deadline and the
//! caller's heartbeat. Any failure discards the partial venv.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::event_log::EventLog;
use crate::models::{BuildMetadata, Environment};
use crate::paths::{DataLayout, venv_python};
use crate::subprocess::{CommandSpec, Heartbeat, SubprocessRunner, Supervision};

const VERSION_PROBE: &str = r#"
import json, platform, sys
from importlib import metadata
try:
    engine = metadata.version(sys.argv[1])
except Exception:
    engine = "unknown"
print(json.dumps({"event": "environment.versions", "data": {"python_version": platform.python_version(), "engine_version": engine}}))
"#;

const VERSIONS_EVENT: &str = "environment.versions";

/// Liveness hooks threaded through a build.
pub struct BuildSupervision<'a> {
    /// Heartbeat of the run that triggered the build.
    pub heartbeat: Option<&'a dyn Heartbeat>,
    /// Interval between heartbeats.
    pub heartbeat_interval: Duration,
    /// Overall build deadline.
    pub timeout: Duration,
}

/// Materializes environments on disk.
#[derive(Debug, Clone)]
pub struct EnvironmentBuilder {
    layout: DataLayout,
    python_bin: PathBuf,
    runner: SubprocessRunner,
}

impl EnvironmentBuilder {
    /// Builder creating environments with `python_bin`.
    pub fn new(layout: DataLayout, python_bin: impl Into<PathBuf>, runner: SubprocessRunner) -> Self {
        Self {
            layout,
            python_bin: python_bin.into(),
            runner,
        }
    }

    /// Event log of an environment's builds.
    pub fn open_log(&self, environment: &Environment) -> Result<EventLog> {
        Ok(EventLog::create(
            self.layout.environment_log(environment),
            json!({
                "environment_id": environment.id,
                "workspace_id": environment.workspace_id,
                "configuration_id": environment.configuration_id,
                "build_generation": environment.build_generation,
            }),
        )?)
    }

    /// Build `environment` from scratch.
    pub async fn build(
        &self,
        environment: &Environment,
        supervision: BuildSupervision<'_>,
        log: &EventLog,
    ) -> Result<BuildMetadata> {
        let venv_dir = self.layout.venv_dir(environment);
        let started = Instant::now();
        log.info(
            "build.started",
            "Environment build started",
            json!({
                "engine_spec": environment.engine_spec,
                "dependency_digest": environment.dependency_digest,
                "venv": venv_dir.display().to_string(),
            }),
        );
        info!(
            environment_id = %environment.id,
            engine_spec = %environment.engine_spec,
            "Building environment"
        );

        match self
            .run_steps(environment, &venv_dir, &supervision, log)
            .await
        {
            Ok(metadata) => {
                log.info(
                    "build.completed",
                    "Environment build completed",
                    json!({
                        "python_interpreter": metadata.python_interpreter,
                        "python_version": metadata.python_version,
                        "engine_version": metadata.engine_version,
                        "duration_ms": started.elapsed().as_millis() as u64,
                    }),
                );
                info!(environment_id = %environment.id, "Environment ready");
                Ok(metadata)
            }
            Err(e) => {
                if let Err(cleanup) = remove_dir_if_exists(&venv_dir).await {
                    warn!(path = %venv_dir.display(), error = %cleanup, "Failed to discard partial environment");
                }
                log.error(
                    "build.failed",
                    format!("Environment build failed: {}", e),
                    json!({ "error": e.to_string() }),
                );
                warn!(environment_id = %environment.id, error = %e, "Environment build failed");
                Err(e)
            }
        }
    }

    async fn run_steps(
        &self,
        environment: &Environment,
        venv_dir: &Path,
        supervision: &BuildSupervision<'_>,
        log: &EventLog,
    ) -> Result<BuildMetadata> {
        let deadline = Instant::now() + supervision.timeout;

        remove_dir_if_exists(venv_dir).await?;
        if let Some(parent) = venv_dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let configuration_dir = self
            .layout
            .configuration_dir(&environment.workspace_id, &environment.configuration_id);
        if !tokio::fs::try_exists(&configuration_dir)
            .await
            .unwrap_or(false)
        {
            return Err(Error::EnvironmentBuild(format!(
                "configuration package not found: {}",
                configuration_dir.display()
            )));
        }

        let python = venv_python(venv_dir);

        self.step(
            "create_venv",
            CommandSpec::new(&self.python_bin)
                .args(["-m", "venv"])
                .arg(venv_dir),
            deadline,
            supervision,
            log,
            None,
        )
        .await?;

        self.step(
            "install_engine",
            CommandSpec::new(&python)
                .args(["-m", "pip", "install", "--disable-pip-version-check"])
                .arg(&environment.engine_spec),
            deadline,
            supervision,
            log,
            None,
        )
        .await?;

        self.step(
            "install_configuration",
            CommandSpec::new(&python)
                .args(["-m", "pip", "install", "--disable-pip-version-check", "-e"])
                .arg(&configuration_dir),
            deadline,
            supervision,
            log,
            None,
        )
        .await?;

        let versions: Mutex<Option<Map<String, Value>>> = Mutex::new(None);
        let capture = |event: &Map<String, Value>| {
            if event.get("event").and_then(Value::as_str) == Some(VERSIONS_EVENT)
                && let Ok(mut slot) = versions.lock()
            {
                *slot = Some(event.clone());
            }
        };
        self.step(
            "probe_versions",
            CommandSpec::new(&python)
                .args(["-c", VERSION_PROBE])
                .arg(engine_distribution(&environment.engine_spec)),
            deadline,
            supervision,
            log,
            Some(&capture),
        )
        .await?;

        let versions = versions
            .into_inner()
            .ok()
            .flatten()
            .ok_or_else(|| Error::EnvironmentBuild("version probe produced no result".to_string()))?;
        let data = versions.get("data").unwrap_or(&Value::Null);
        let field = |name: &str| {
            data.get(name)
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string()
        };

        Ok(BuildMetadata {
            python_interpreter: python.display().to_string(),
            python_version: field("python_version"),
            engine_version: field("engine_version"),
        })
    }

    async fn step(
        &self,
        name: &str,
        spec: CommandSpec,
        deadline: Instant,
        supervision: &BuildSupervision<'_>,
        log: &EventLog,
        on_event: Option<&(dyn Fn(&Map<String, Value>) + Send + Sync)>,
    ) -> Result<()> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::EnvironmentBuild(format!(
                "build deadline exceeded before step {}",
                name
            )));
        }

        log.info(
            "build.step.started",
            format!("Step {} started", name),
            json!({ "step": name, "command": spec.display() }),
        );

        let outcome = self
            .runner
            .run(
                &spec,
                Supervision {
                    timeout: remaining,
                    heartbeat: supervision.heartbeat,
                    heartbeat_interval: supervision.heartbeat_interval,
                    on_event,
                    log,
                },
            )
            .await?;

        if outcome.timed_out {
            return Err(Error::EnvironmentBuild(format!(
                "step {} exceeded the build deadline",
                name
            )));
        }
        if outcome.exit_code != 0 {
            return Err(Error::EnvironmentBuild(format!(
                "step {} exited with code {}",
                name, outcome.exit_code
            )));
        }

        log.info(
            "build.step.completed",
            format!("Step {} completed", name),
            json!({
                "step": name,
                "exit_code": outcome.exit_code,
                "duration_ms": outcome.duration.as_millis() as u64,
            }),
        );
        Ok(())
    }
}

/// Distribution name of a requirement (`extract-engine[xlsx]>=1.2` -> `extract-engine`).
pub fn engine_distribution(engine_spec: &str) -> &str {
    let end = engine_spec
        .find(|c: char| matches!(c, '=' | '<' | '>' | '!' | '~' | '[' | ';' | '@' | ' '))
        .unwrap_or(engine_spec.len());
    engine_spec[..end].trim()
}

async fn remove_dir_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
