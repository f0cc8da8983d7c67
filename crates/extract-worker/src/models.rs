// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain types shared by the lease store, the run processor and the worker loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Waiting to be claimed (possibly not yet due).
    Queued,
    /// Leased by a worker.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished with a terminal failure.
    Failed,
}

impl RunStatus {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }

    /// Whether the run can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(RunStatus::Queued),
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            _ => Err(format!("Unknown run status: {}", s)),
        }
    }
}

/// Build state of a cached environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentStatus {
    /// Referenced but never recorded.
    Missing,
    /// Recorded, waiting for its first build.
    Queued,
    /// A worker holds the build lock and is building it.
    Building,
    /// Built and immutable.
    Ready,
    /// Last build failed; the next run that needs it rebuilds it.
    Failed,
}

impl EnvironmentStatus {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentStatus::Missing => "missing",
            EnvironmentStatus::Queued => "queued",
            EnvironmentStatus::Building => "building",
            EnvironmentStatus::Ready => "ready",
            EnvironmentStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EnvironmentStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "missing" => Ok(EnvironmentStatus::Missing),
            "queued" => Ok(EnvironmentStatus::Queued),
            "building" => Ok(EnvironmentStatus::Building),
            "ready" => Ok(EnvironmentStatus::Ready),
            "failed" => Ok(EnvironmentStatus::Failed),
            _ => Err(format!("Unknown environment status: {}", s)),
        }
    }
}

/// A unit of work: one extraction of one input document with one configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Run identifier.
    pub id: String,
    /// Owning workspace.
    pub workspace_id: String,
    /// Configuration package to extract with.
    pub configuration_id: String,
    /// Input document reference.
    pub input_document_id: String,
    /// Engine package requirement (e.g. `extract-engine==1.4.0`).
    pub engine_spec: String,
    /// Opaque digest of the configuration's dependency set.
    pub dependency_digest: String,
    /// Current status.
    pub status: RunStatus,
    /// Number of claims so far.
    pub attempt_count: i32,
    /// Maximum number of claims before the run fails terminally.
    pub max_attempts: i32,
    /// Worker currently holding the lease.
    pub lease_owner: Option<String>,
    /// Token identifying the current lease.
    pub lease_token: Option<Uuid>,
    /// When the current lease expires.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Earliest time the run may be claimed again.
    pub next_due_at: Option<DateTime<Utc>>,
    /// Producer-supplied options payload.
    pub run_options: Value,
    /// Environment the run executed in.
    pub environment_id: Option<String>,
    /// When the run was enqueued.
    pub created_at: DateTime<Utc>,
    /// When the run was first claimed.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Engine exit code of the last attempt, if any.
    pub exit_code: Option<i32>,
    /// Error message of the last failed attempt.
    pub error_message: Option<String>,
    /// Durable location of the produced output artifact.
    pub output_path: Option<String>,
    /// Summary derived from the engine's completion payload.
    pub summary: Option<Value>,
}

impl Run {
    /// Cache key of the environment this run needs.
    pub fn environment_key(&self) -> EnvironmentKey {
        EnvironmentKey {
            workspace_id: self.workspace_id.clone(),
            configuration_id: self.configuration_id.clone(),
            engine_spec: self.engine_spec.clone(),
            dependency_digest: self.dependency_digest.clone(),
        }
    }
}

/// Producer-side payload for enqueueing a run.
#[derive(Debug, Clone)]
pub struct NewRun {
    /// Run identifier.
    pub id: String,
    /// Owning workspace.
    pub workspace_id: String,
    /// Configuration package.
    pub configuration_id: String,
    /// Input document.
    pub input_document_id: String,
    /// Engine package requirement.
    pub engine_spec: String,
    /// Dependency digest.
    pub dependency_digest: String,
    /// Maximum number of attempts.
    pub max_attempts: i32,
    /// Options payload.
    pub run_options: Value,
    /// Optional delayed start.
    pub next_due_at: Option<DateTime<Utc>>,
}

impl NewRun {
    /// A run with a fresh id, three attempts and empty options.
    pub fn new(
        workspace_id: impl Into<String>,
        configuration_id: impl Into<String>,
        input_document_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workspace_id: workspace_id.into(),
            configuration_id: configuration_id.into(),
            input_document_id: input_document_id.into(),
            engine_spec: "extract-engine".to_string(),
            dependency_digest: "sha256:none".to_string(),
            max_attempts: 3,
            run_options: Value::Object(Default::default()),
            next_due_at: None,
        }
    }

    /// Set the engine requirement and dependency digest.
    pub fn with_engine(mut self, engine_spec: impl Into<String>, digest: impl Into<String>) -> Self {
        self.engine_spec = engine_spec.into();
        self.dependency_digest = digest.into();
        self
    }

    /// Set the options payload.
    pub fn with_options(mut self, options: Value) -> Self {
        self.run_options = options;
        self
    }

    /// Set the attempt budget.
    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// Ephemeral view over a freshly claimed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunClaim {
    /// Claimed run.
    pub run_id: String,
    /// Attempt number of this claim (1-based).
    pub attempt_count: i32,
    /// Attempt budget.
    pub max_attempts: i32,
    /// Token that heartbeats and acks must present.
    pub lease_token: Uuid,
}

/// Payload recorded by a successful acknowledgement.
#[derive(Debug, Clone, Default)]
pub struct RunSuccess {
    /// Engine exit code (0 for engine-less completions).
    pub exit_code: i32,
    /// Durable output location, when an artifact was produced.
    pub output_path: Option<String>,
    /// Summary derived from the completion payload.
    pub summary: Option<Value>,
    /// Environment used.
    pub environment_id: Option<String>,
}

/// Payload recorded by a failure acknowledgement.
#[derive(Debug, Clone)]
pub struct RunFailure {
    /// Engine exit code, when a process ran.
    pub exit_code: Option<i32>,
    /// Human readable reason.
    pub error_message: String,
    /// When to retry; `None` makes the failure terminal.
    pub retry_at: Option<DateTime<Utc>>,
}

/// Cache key of an environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvironmentKey {
    /// Owning workspace.
    pub workspace_id: String,
    /// Configuration package.
    pub configuration_id: String,
    /// Engine package requirement.
    pub engine_spec: String,
    /// Dependency digest.
    pub dependency_digest: String,
}

impl EnvironmentKey {
    /// Advisory lock key serializing builds of this environment.
    pub fn lock_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.workspace_id, self.configuration_id, self.engine_spec, self.dependency_digest
        )
    }
}

/// A cached, buildable execution environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    /// Environment identifier.
    pub id: String,
    /// Owning workspace.
    pub workspace_id: String,
    /// Configuration package.
    pub configuration_id: String,
    /// Engine package requirement.
    pub engine_spec: String,
    /// Dependency digest.
    pub dependency_digest: String,
    /// Current build state.
    pub status: EnvironmentStatus,
    /// Incremented every time a build starts.
    pub build_generation: i32,
    /// Interpreter inside the environment.
    pub python_interpreter: Option<String>,
    /// Interpreter version string.
    pub python_version: Option<String>,
    /// Installed engine version string.
    pub engine_version: Option<String>,
    /// Error of the last failed build.
    pub error_message: Option<String>,
    /// When the environment was first recorded.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
    /// Last time a run used it.
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Environment {
    /// Cache key of this environment.
    pub fn key(&self) -> EnvironmentKey {
        EnvironmentKey {
            workspace_id: self.workspace_id.clone(),
            configuration_id: self.configuration_id.clone(),
            engine_spec: self.engine_spec.clone(),
            dependency_digest: self.dependency_digest.clone(),
        }
    }
}

/// Facts recorded when a build succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildMetadata {
    /// Interpreter inside the environment.
    pub python_interpreter: String,
    /// Interpreter version string.
    pub python_version: String,
    /// Installed engine version string.
    pub engine_version: String,
}

/// An uploaded input document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Document identifier.
    pub id: String,
    /// Owning workspace.
    pub workspace_id: String,
    /// Name the file was uploaded with.
    pub original_filename: String,
    /// Path relative to the workspace document directory.
    pub stored_path: String,
    /// Soft-delete marker.
    pub deleted_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_round_trips_through_str() {
        for status in [
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Succeeded,
            RunStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("paused".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn test_environment_status_parse_is_case_insensitive() {
        assert_eq!(
            "READY".parse::<EnvironmentStatus>().unwrap(),
            EnvironmentStatus::Ready
        );
        assert!("gone".parse::<EnvironmentStatus>().is_err());
    }

    #[test]
    fn test_lock_key_joins_all_key_parts() {
        let key = EnvironmentKey {
            workspace_id: "ws-1".to_string(),
            configuration_id: "cfg-2".to_string(),
            engine_spec: "extract-engine==1.4.0".to_string(),
            dependency_digest: "sha256:abc".to_string(),
        };
        assert_eq!(key.lock_key(), "ws-1:cfg-2:extract-engine==1.4.0:sha256:abc");
    }

    #[test]
    fn test_new_run_defaults() {
        let run = NewRun::new("ws", "cfg", "doc")
            .with_engine("extract-engine==2.0", "sha256:1")
            .with_max_attempts(5);
        assert_eq!(run.max_attempts, 5);
        assert_eq!(run.engine_spec, "extract-engine==2.0");
        assert_eq!(run.dependency_digest, "sha256:1");
        assert!(run.run_options.as_object().unwrap().is_empty());
        assert!(Uuid::parse_str(&run.id).is_ok());
    }
}
