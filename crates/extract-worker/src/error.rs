// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for extract-worker.

use thiserror::Error;

/// Worker errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration failed.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Subprocess supervision failed.
    #[error("Subprocess error: {0}")]
    Subprocess(#[from] crate::subprocess::SubprocessError),

    /// The run's lease was lost; all work on the attempt must stop.
    #[error("Lease lost for run {0}")]
    LeaseLost(String),

    /// Run row does not exist.
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// Input document is missing or soft-deleted.
    #[error("Input document unavailable: {0}")]
    DocumentUnavailable(String),

    /// A ready environment's files are missing.
    #[error("Environment missing: {0}")]
    EnvironmentMissing(String),

    /// Environment build failed.
    #[error("Environment build failed: {0}")]
    EnvironmentBuild(String),

    /// Engine exited with a non-zero code.
    #[error("Engine exited with code {0}")]
    EngineFailed(i32),

    /// Engine exceeded the run timeout.
    #[error("Engine timed out after {0}s")]
    EngineTimedOut(u64),

    /// Engine finished without a usable result.
    #[error("Engine result unusable: {0}")]
    EngineResult(String),

    /// Run options payload is malformed.
    #[error("Invalid run options: {0}")]
    InvalidRunOptions(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error is the cooperative cancellation signal.
    pub fn is_lease_lost(&self) -> bool {
        matches!(
            self,
            Error::LeaseLost(_) | Error::Subprocess(crate::subprocess::SubprocessError::LeaseLost)
        )
    }

    /// Whether another attempt could succeed. A malformed options payload
    /// fails the same way every time.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::InvalidRunOptions(_))
    }

    /// Engine exit code carried by this error, if a process ran.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Error::EngineFailed(code) => Some(*code),
            Error::EngineTimedOut(_) => Some(crate::subprocess::TIMEOUT_EXIT_CODE),
            _ => None,
        }
    }
}

/// Result type using the worker Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subprocess::SubprocessError;

    #[test]
    fn test_lease_lost_classification() {
        assert!(Error::LeaseLost("run-1".to_string()).is_lease_lost());
        assert!(Error::Subprocess(SubprocessError::LeaseLost).is_lease_lost());
        assert!(!Error::EngineFailed(3).is_lease_lost());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::EngineFailed(3).is_retryable());
        assert!(Error::DocumentUnavailable("doc".into()).is_retryable());
        assert!(!Error::InvalidRunOptions("bad".into()).is_retryable());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::EngineFailed(3).exit_code(), Some(3));
        assert_eq!(
            Error::EngineTimedOut(600).exit_code(),
            Some(crate::subprocess::TIMEOUT_EXIT_CODE)
        );
        assert_eq!(Error::DocumentUnavailable("doc".into()).exit_code(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Error::EngineFailed(3).to_string(),
            "Engine exited with code 3"
        );
        assert_eq!(
            Error::LeaseLost("run-9".into()).to_string(),
            "Lease lost for run run-9"
        );
    }
}
