// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Extract Worker - Distributed Run Execution
//!
//! A worker process responsible for:
//! - Claiming queued runs under a time-bounded lease
//! - Building and caching per-configuration Python environments
//! - Executing the extraction engine under supervision
//! - Recording outcomes and scheduling retries

use std::sync::Arc;
use tracing::{info, warn};

use extract_worker::config::Config;
use extract_worker::listener::PgQueueListener;
use extract_worker::migrations;
use extract_worker::runtime::WorkerRuntime;
use extract_worker::store::PgLeaseStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "extract_worker=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        worker_id = %config.worker_id,
        concurrency = config.concurrency,
        data_dir = %config.data_dir.display(),
        "Starting Extract Worker"
    );

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await?;

    info!("Connected to database");

    migrations::run(&pool).await?;

    info!("Database schema verified");

    // Without LISTEN the loop still polls; a later wait reconnects.
    let listener = match PgQueueListener::connect(pool.clone(), config.queue_channel.clone()).await
    {
        Ok(listener) => listener,
        Err(e) => {
            warn!(error = %e, "Queue listener unavailable, starting in polling mode");
            PgQueueListener::new(pool.clone(), config.queue_channel.clone())
        }
    };

    let runtime = WorkerRuntime::builder()
        .config(&config)
        .store(Arc::new(PgLeaseStore::new(pool)))
        .listener(Box::new(listener))
        .build()?
        .start()
        .await?;

    info!(worker_id = %runtime.worker_id(), "Worker ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Extract Worker shut down");

    Ok(())
}
