// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable storage of run inputs and artifacts.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::{Document, Run};
use crate::paths::DataLayout;

/// Resolves input documents and persists run outputs and logs.
#[async_trait]
pub trait ArtifactStorage: Send + Sync {
    /// Local path of a document's content; `DocumentUnavailable` when absent.
    async fn document_path(&self, document: &Document) -> Result<PathBuf>;

    /// Persist the engine's output artifact; returns its durable location.
    async fn store_output(&self, run: &Run, artifact: &Path) -> Result<String>;

    /// Persist an attempt's event log; returns its durable location.
    async fn store_logs(&self, run: &Run, attempt: i32, log: &Path) -> Result<String>;
}

/// Artifact storage on the local filesystem under the data directory.
#[derive(Debug, Clone)]
pub struct FsArtifactStorage {
    layout: DataLayout,
}

impl FsArtifactStorage {
    /// Storage rooted at `layout`.
    pub fn new(layout: DataLayout) -> Self {
        Self { layout }
    }
}

#[async_trait]
impl ArtifactStorage for FsArtifactStorage {
    async fn document_path(&self, document: &Document) -> Result<PathBuf> {
        let path = self.layout.document_path(document);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(Error::DocumentUnavailable(format!(
                "{} (missing file {})",
                document.id,
                path.display()
            )));
        }
        Ok(path)
    }

    async fn store_output(&self, run: &Run, artifact: &Path) -> Result<String> {
        let file_name = artifact
            .file_name()
            .ok_or_else(|| Error::EngineResult(format!("not a file: {}", artifact.display())))?;
        let dir = self
            .layout
            .run_artifacts_dir(&run.workspace_id, &run.id)
            .join("output");
        tokio::fs::create_dir_all(&dir).await?;
        let target = dir.join(file_name);
        tokio::fs::copy(artifact, &target).await?;
        debug!(run_id = %run.id, path = %target.display(), "Stored output artifact");
        Ok(target.display().to_string())
    }

    async fn store_logs(&self, run: &Run, attempt: i32, log: &Path) -> Result<String> {
        let dir = self
            .layout
            .run_artifacts_dir(&run.workspace_id, &run.id)
            .join("logs");
        tokio::fs::create_dir_all(&dir).await?;
        let target = dir.join(format!("attempt-{}.ndjson", attempt));
        tokio::fs::copy(log, &target).await?;
        debug!(run_id = %run.id, path = %target.display(), "Stored run log");
        Ok(target.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewRun;
    use crate::store::{LeaseStore, MemoryLeaseStore};
    use tempfile::TempDir;

    async fn run() -> Run {
        let store = MemoryLeaseStore::new();
        let id = store.enqueue_run(NewRun::new("ws-1", "cfg-1", "doc-1"));
        store.get_run(&id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_missing_document_is_unavailable() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FsArtifactStorage::new(DataLayout::new(temp_dir.path()));
        let document = Document {
            id: "doc-1".to_string(),
            workspace_id: "ws-1".to_string(),
            original_filename: "orders.xlsx".to_string(),
            stored_path: "doc-1.xlsx".to_string(),
            deleted_at: None,
        };

        let err = storage.document_path(&document).await.unwrap_err();
        assert!(matches!(err, Error::DocumentUnavailable(_)));

        let path = DataLayout::new(temp_dir.path()).document_path(&document);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"xlsx").unwrap();
        assert_eq!(storage.document_path(&document).await.unwrap(), path);
    }

    #[tokio::test]
    async fn test_outputs_and_logs_land_in_run_artifacts() {
        let temp_dir = TempDir::new().unwrap();
        let layout = DataLayout::new(temp_dir.path().join("data"));
        let storage = FsArtifactStorage::new(layout.clone());
        let run = run().await;

        let artifact = temp_dir.path().join("normalized.xlsx");
        std::fs::write(&artifact, b"out").unwrap();
        let log = temp_dir.path().join("events.ndjson");
        std::fs::write(&log, b"{}\n").unwrap();

        let output = storage.store_output(&run, &artifact).await.unwrap();
        let logs = storage.store_logs(&run, 2, &log).await.unwrap();

        let base = layout.run_artifacts_dir("ws-1", &run.id);
        assert_eq!(PathBuf::from(&output), base.join("output/normalized.xlsx"));
        assert_eq!(PathBuf::from(&logs), base.join("logs/attempt-2.ndjson"));
        assert_eq!(std::fs::read(output).unwrap(), b"out");
    }
}
