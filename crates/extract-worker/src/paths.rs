// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Filesystem layout under the data directory.
//!
//! ```text
//! {DATA_DIR}/
//!   work/runs/{run_id}/                         per-attempt scratch, removed after every attempt
//!   workspaces/{workspace_id}/
//!     documents/{stored_path}                   uploaded input documents
//!     configurations/{configuration_id}/        configuration packages
//!     environments/{environment_id}/venv/       built interpreter environment
//!     environments/{environment_id}/logs/       build event logs
//!     runs/{run_id}/output/, runs/{run_id}/logs/  durable run artifacts
//! ```

use std::path::{Path, PathBuf};

use crate::models::{Document, Environment};

/// Resolves every path the worker reads or writes.
#[derive(Debug, Clone)]
pub struct DataLayout {
    data_dir: PathBuf,
}

impl DataLayout {
    /// Create a layout rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Root directory.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn workspace_dir(&self, workspace_id: &str) -> PathBuf {
        self.data_dir.join("workspaces").join(workspace_id)
    }

    /// Scratch directory of one run attempt.
    pub fn run_work_dir(&self, run_id: &str) -> PathBuf {
        self.data_dir.join("work").join("runs").join(run_id)
    }

    /// Where an uploaded document lives.
    pub fn document_path(&self, document: &Document) -> PathBuf {
        self.workspace_dir(&document.workspace_id)
            .join("documents")
            .join(&document.stored_path)
    }

    /// Configuration package installed into environments.
    pub fn configuration_dir(&self, workspace_id: &str, configuration_id: &str) -> PathBuf {
        self.workspace_dir(workspace_id)
            .join("configurations")
            .join(configuration_id)
    }

    /// Root of one environment.
    pub fn environment_dir(&self, environment: &Environment) -> PathBuf {
        self.workspace_dir(&environment.workspace_id)
            .join("environments")
            .join(&environment.id)
    }

    /// Interpreter environment; recreated from scratch on every build.
    pub fn venv_dir(&self, environment: &Environment) -> PathBuf {
        self.environment_dir(environment).join("venv")
    }

    /// Build event log of an environment.
    pub fn environment_log(&self, environment: &Environment) -> PathBuf {
        self.environment_dir(environment)
            .join("logs")
            .join("build.ndjson")
    }

    /// Durable artifact directory of a run.
    pub fn run_artifacts_dir(&self, workspace_id: &str, run_id: &str) -> PathBuf {
        self.workspace_dir(workspace_id).join("runs").join(run_id)
    }
}

/// Interpreter inside an environment directory.
pub fn venv_python(venv_dir: &Path) -> PathBuf {
    venv_dir.join("bin").join("python")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EnvironmentStatus;
    use chrono::Utc;

    fn environment() -> Environment {
        Environment {
            id: "env-1".to_string(),
            workspace_id: "ws-1".to_string(),
            configuration_id: "cfg-1".to_string(),
            engine_spec: "extract-engine".to_string(),
            dependency_digest: "sha256:0".to_string(),
            status: EnvironmentStatus::Queued,
            build_generation: 0,
            python_interpreter: None,
            python_version: None,
            engine_version: None,
            error_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_used_at: None,
        }
    }

    #[test]
    fn test_run_and_environment_paths() {
        let layout = DataLayout::new("/data");
        assert_eq!(
            layout.run_work_dir("run-1"),
            PathBuf::from("/data/work/runs/run-1")
        );

        let env = environment();
        assert_eq!(
            layout.venv_dir(&env),
            PathBuf::from("/data/workspaces/ws-1/environments/env-1/venv")
        );
        assert_eq!(
            layout.environment_log(&env),
            PathBuf::from("/data/workspaces/ws-1/environments/env-1/logs/build.ndjson")
        );
        assert_eq!(
            venv_python(&layout.venv_dir(&env)),
            PathBuf::from("/data/workspaces/ws-1/environments/env-1/venv/bin/python")
        );
    }

    #[test]
    fn test_workspace_scoped_paths() {
        let layout = DataLayout::new("/data");
        let document = Document {
            id: "doc-1".to_string(),
            workspace_id: "ws-1".to_string(),
            original_filename: "orders.xlsx".to_string(),
            stored_path: "ab/doc-1.xlsx".to_string(),
            deleted_at: None,
        };
        assert_eq!(
            layout.document_path(&document),
            PathBuf::from("/data/workspaces/ws-1/documents/ab/doc-1.xlsx")
        );
        assert_eq!(
            layout.configuration_dir("ws-1", "cfg-9"),
            PathBuf::from("/data/workspaces/ws-1/configurations/cfg-9")
        );
        assert_eq!(
            layout.run_artifacts_dir("ws-1", "run-1"),
            PathBuf::from("/data/workspaces/ws-1/runs/run-1")
        );
    }
}
