// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for extract-worker.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string.
    pub database_url: String,
    /// Maximum pool connections.
    pub db_max_connections: u32,
    /// Identity written into `lease_owner`.
    pub worker_id: String,
    /// Runs executed in parallel by this process.
    pub concurrency: usize,
    /// Upper bound on runs claimed per query.
    pub claim_batch_size: usize,
    /// Lease duration granted by claims and heartbeats.
    pub lease_duration: Duration,
    /// How often an active run renews its lease.
    pub heartbeat_interval: Duration,
    /// Longest the main loop blocks on the queue listener.
    pub listen_timeout: Duration,
    /// Period of the lease-expiry sweep.
    pub maintenance_interval: Duration,
    /// Backoff for failed attempts.
    pub retry: RetryPolicy,
    /// Wall-clock budget of one engine run.
    pub run_timeout: Duration,
    /// Wall-clock budget of one environment build.
    pub env_build_timeout: Duration,
    /// Poll interval while waiting for an environment build lock.
    pub env_lock_poll_interval: Duration,
    /// How long shutdown waits for in-flight runs.
    pub shutdown_grace: Duration,
    /// Root of environments, run working directories and artifacts.
    pub data_dir: PathBuf,
    /// Interpreter used to create environments.
    pub python_bin: PathBuf,
    /// Engine module invoked as `python -m <module>`.
    pub engine_module: String,
    /// Notification channel producers publish to.
    pub queue_channel: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("EXTRACT_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .map_err(|_| ConfigError::Missing("EXTRACT_DATABASE_URL or DATABASE_URL"))?;

        let concurrency: usize = parse_var("EXTRACT_WORKER_CONCURRENCY", 2)?;
        if concurrency == 0 {
            return Err(ConfigError::Invalid(
                "EXTRACT_WORKER_CONCURRENCY",
                "must be at least 1",
            ));
        }
        let claim_batch_size: usize = parse_var("EXTRACT_WORKER_CLAIM_BATCH", concurrency)?;
        if claim_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "EXTRACT_WORKER_CLAIM_BATCH",
                "must be at least 1",
            ));
        }

        let lease_duration = secs_var("EXTRACT_WORKER_LEASE_SECS", 900)?;
        let heartbeat_interval = secs_var("EXTRACT_WORKER_HEARTBEAT_SECS", 30)?;
        if heartbeat_interval.is_zero() || heartbeat_interval >= lease_duration {
            return Err(ConfigError::Invalid(
                "EXTRACT_WORKER_HEARTBEAT_SECS",
                "must be positive and shorter than the lease duration",
            ));
        }

        let backoff_base = secs_var("EXTRACT_WORKER_BACKOFF_BASE_SECS", 5)?;
        let backoff_max = secs_var("EXTRACT_WORKER_BACKOFF_MAX_SECS", 300)?;
        if backoff_max < backoff_base {
            return Err(ConfigError::Invalid(
                "EXTRACT_WORKER_BACKOFF_MAX_SECS",
                "must not be smaller than the backoff base",
            ));
        }

        let worker_id = std::env::var("EXTRACT_WORKER_ID").unwrap_or_else(|_| default_worker_id());

        Ok(Self {
            database_url,
            db_max_connections: parse_var("EXTRACT_DB_MAX_CONNECTIONS", 10)?,
            worker_id,
            concurrency,
            claim_batch_size,
            lease_duration,
            heartbeat_interval,
            listen_timeout: secs_var("EXTRACT_WORKER_LISTEN_TIMEOUT_SECS", 60)?,
            maintenance_interval: secs_var("EXTRACT_WORKER_MAINTENANCE_SECS", 30)?,
            retry: RetryPolicy::new(backoff_base, backoff_max),
            run_timeout: secs_var("EXTRACT_RUN_TIMEOUT_SECS", 600)?,
            env_build_timeout: secs_var("EXTRACT_ENV_BUILD_TIMEOUT_SECS", 900)?,
            env_lock_poll_interval: Duration::from_millis(parse_var(
                "EXTRACT_ENV_LOCK_POLL_MS",
                1000,
            )?),
            shutdown_grace: secs_var("EXTRACT_SHUTDOWN_GRACE_SECS", 30)?,
            data_dir: PathBuf::from(
                std::env::var("EXTRACT_DATA_DIR").unwrap_or_else(|_| ".data".to_string()),
            ),
            python_bin: PathBuf::from(
                std::env::var("EXTRACT_PYTHON_BIN").unwrap_or_else(|_| "python3".to_string()),
            ),
            engine_module: std::env::var("EXTRACT_ENGINE_MODULE")
                .unwrap_or_else(|_| "extract_engine".to_string()),
            queue_channel: std::env::var("EXTRACT_QUEUE_CHANNEL")
                .unwrap_or_else(|_| "run_queued".to_string()),
        })
    }

    /// Lease duration in whole seconds, as stored in the database.
    pub fn lease_seconds(&self) -> i64 {
        self.lease_duration.as_secs() as i64
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(name, "must be a non-negative integer")),
        Err(_) => Ok(default),
    }
}

fn secs_var(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    parse_var(name, default).map(Duration::from_secs)
}

fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", host, std::process::id(), &suffix[..8])
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: [&str; 8] = [
        "EXTRACT_WORKER_CONCURRENCY",
        "EXTRACT_WORKER_CLAIM_BATCH",
        "EXTRACT_WORKER_LEASE_SECS",
        "EXTRACT_WORKER_HEARTBEAT_SECS",
        "EXTRACT_WORKER_BACKOFF_BASE_SECS",
        "EXTRACT_WORKER_BACKOFF_MAX_SECS",
        "EXTRACT_WORKER_ID",
        "EXTRACT_DATA_DIR",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for var in VARS {
                guard.remove(var);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("EXTRACT_DATABASE_URL", "postgres://localhost/extract");

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "postgres://localhost/extract");
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.claim_batch_size, 2);
        assert_eq!(config.lease_duration, Duration::from_secs(900));
        assert_eq!(config.lease_seconds(), 900);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.retry.base, Duration::from_secs(5));
        assert_eq!(config.retry.max, Duration::from_secs(300));
        assert_eq!(config.data_dir, PathBuf::from(".data"));
        assert_eq!(config.queue_channel, "run_queued");
        assert!(!config.worker_id.is_empty());
    }

    #[test]
    fn test_database_url_fallback() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.remove("EXTRACT_DATABASE_URL");
        guard.set("DATABASE_URL", "postgres://fallback/db");

        let config = Config::from_env().unwrap();
        assert_eq!(config.database_url, "postgres://fallback/db");
    }

    #[test]
    fn test_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.remove("EXTRACT_DATABASE_URL");
        guard.remove("DATABASE_URL");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
        assert!(err.to_string().contains("EXTRACT_DATABASE_URL"));
    }

    #[test]
    fn test_custom_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("EXTRACT_DATABASE_URL", "postgres://localhost/extract");
        guard.set("EXTRACT_WORKER_CONCURRENCY", "8");
        guard.set("EXTRACT_WORKER_CLAIM_BATCH", "4");
        guard.set("EXTRACT_WORKER_LEASE_SECS", "120");
        guard.set("EXTRACT_WORKER_HEARTBEAT_SECS", "10");
        guard.set("EXTRACT_WORKER_ID", "worker-a");

        let config = Config::from_env().unwrap();
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.claim_batch_size, 4);
        assert_eq!(config.lease_duration, Duration::from_secs(120));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.worker_id, "worker-a");
    }

    #[test]
    fn test_heartbeat_must_be_shorter_than_lease() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("EXTRACT_DATABASE_URL", "postgres://localhost/extract");
        guard.set("EXTRACT_WORKER_LEASE_SECS", "30");
        guard.set("EXTRACT_WORKER_HEARTBEAT_SECS", "30");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("EXTRACT_WORKER_HEARTBEAT_SECS", _)
        ));
    }

    #[test]
    fn test_invalid_numbers() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("EXTRACT_DATABASE_URL", "postgres://localhost/extract");
        guard.set("EXTRACT_WORKER_CONCURRENCY", "-1");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("EXTRACT_WORKER_CONCURRENCY", _)
        ));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("EXTRACT_DATABASE_URL", "postgres://localhost/extract");
        guard.set("EXTRACT_WORKER_CONCURRENCY", "0");

        assert!(Config::from_env().is_err());
    }

    #[test]
    fn test_backoff_max_below_base_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("EXTRACT_DATABASE_URL", "postgres://localhost/extract");
        guard.set("EXTRACT_WORKER_BACKOFF_BASE_SECS", "60");
        guard.set("EXTRACT_WORKER_BACKOFF_MAX_SECS", "10");

        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Invalid("EXTRACT_WORKER_BACKOFF_MAX_SECS", _)
        ));
    }
}
