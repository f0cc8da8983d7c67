// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Extract Worker - Distributed Run Execution
//!
//! A pool of identical worker processes that pull extraction runs from a
//! shared PostgreSQL queue, build cached Python environments on demand and
//! execute the extraction engine as a supervised subprocess.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        Producers (API, CLI)                           │
//! │                 INSERT INTO runs ... status = 'queued'                │
//! └──────────────────────────────────────────────────────────────────────┘
//!                                   │
//!                                   ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                             PostgreSQL                                │
//! │        runs (leases) · environments (cache) · documents               │
//! │        NOTIFY run_queued · advisory locks for builds                  │
//! └──────────────────────────────────────────────────────────────────────┘
//!          ▲ claim / heartbeat / ack          ▲ claim / heartbeat / ack
//!          │                                  │
//! ┌──────────────────────────┐      ┌──────────────────────────┐
//! │  extract-worker (N)      │      │  extract-worker (M)      │
//! │  ┌────────┐ ┌─────────┐  │      │          ...             │
//! │  │ Worker │→│Processor│  │      │                          │
//! │  └────────┘ └────┬────┘  │      └──────────────────────────┘
//! │        ┌─────────┴──────┐│
//! │        ▼                ▼│
//! │  ┌───────────┐ ┌────────┐│
//! │  │Environment│ │ Engine ││
//! │  │  Manager  │ │subproc.││
//! │  └───────────┘ └────────┘│
//! └──────────────────────────┘
//! ```
//!
//! # Run Status State Machine
//!
//! ```text
//!        enqueue
//!           │
//!           ▼
//!      ┌─────────┐   claim    ┌─────────┐  ack success  ┌───────────┐
//!      │ QUEUED  │───────────►│ RUNNING │──────────────►│ SUCCEEDED │
//!      └─────────┘            └────┬────┘               └───────────┘
//!           ▲                      │
//!           │ failure / lease      │ failure or lease expiry
//!           │ expiry with budget   │ with attempts exhausted
//!           └──────────────────────┤
//!                                  ▼
//!                             ┌────────┐
//!                             │ FAILED │
//!                             └────────┘
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `EXTRACT_DATABASE_URL` | Yes* | - | PostgreSQL connection string |
//! | `DATABASE_URL` | Yes* | - | Fallback if above not set |
//! | `EXTRACT_WORKER_ID` | No | host-pid-random | Lease owner identity |
//! | `EXTRACT_WORKER_CONCURRENCY` | No | `2` | Runs in flight per process |
//! | `EXTRACT_WORKER_CLAIM_BATCH` | No | concurrency | Runs claimed per query |
//! | `EXTRACT_WORKER_LEASE_SECS` | No | `900` | Lease duration |
//! | `EXTRACT_WORKER_HEARTBEAT_SECS` | No | `30` | Heartbeat interval |
//! | `EXTRACT_WORKER_LISTEN_TIMEOUT_SECS` | No | `60` | Longest listener wait |
//! | `EXTRACT_WORKER_MAINTENANCE_SECS` | No | `30` | Lease-expiry sweep period |
//! | `EXTRACT_WORKER_BACKOFF_BASE_SECS` | No | `5` | First retry delay |
//! | `EXTRACT_WORKER_BACKOFF_MAX_SECS` | No | `300` | Retry delay cap |
//! | `EXTRACT_RUN_TIMEOUT_SECS` | No | `600` | Engine wall-clock budget |
//! | `EXTRACT_ENV_BUILD_TIMEOUT_SECS` | No | `900` | Environment build budget |
//! | `EXTRACT_ENV_LOCK_POLL_MS` | No | `1000` | Build lock poll interval |
//! | `EXTRACT_SHUTDOWN_GRACE_SECS` | No | `30` | Drain period on shutdown |
//! | `EXTRACT_DATA_DIR` | No | `.data` | Environments, work dirs, artifacts |
//! | `EXTRACT_PYTHON_BIN` | No | `python3` | Interpreter used to create venvs |
//! | `EXTRACT_ENGINE_MODULE` | No | `extract_engine` | Engine module |
//! | `EXTRACT_QUEUE_CHANNEL` | No | `run_queued` | Notification channel |
//! | `EXTRACT_DB_MAX_CONNECTIONS` | No | `10` | Pool size |

#![deny(missing_docs)]

/// Database migrations for extract-worker.
pub mod migrations;

/// Worker configuration loaded from environment variables.
pub mod config;

/// Error types for worker operations.
pub mod error;

/// Domain types: runs, claims, environments, documents.
pub mod models;

/// Exponential backoff for failed attempts.
pub mod retry;

/// Producer-supplied run options.
pub mod run_options;

/// On-disk layout of the data directory.
pub mod paths;

/// Structured NDJSON event logs for runs and builds.
pub mod event_log;

/// Supervised subprocess execution.
pub mod subprocess;

/// Lease store implementations (PostgreSQL and in-memory).
pub mod store;

/// Lease handle of one claimed run.
pub mod lease;

/// Queue wake-up listeners.
pub mod listener;

/// Input document resolution and artifact persistence.
pub mod storage;

/// Environment build recipe.
pub mod env_builder;

/// Environment readiness with build deduplication.
pub mod environment;

/// Execution of one run attempt.
pub mod processor;

/// Claim and dispatch loop.
pub mod worker;

/// Embeddable runtime for extract-worker.
pub mod runtime;

pub use config::Config;
pub use error::{Error, Result};
