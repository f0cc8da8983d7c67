// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL lease store.
//!
//! Claims and lease sweeps lock candidate rows with `FOR UPDATE SKIP LOCKED`
//! so concurrent workers never block on, or double-claim, the same run.
//! Environment build locks are session-level advisory locks held on a
//! dedicated pooled connection.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{EnvironmentLock, LeaseStore, advisory_lock_id};
use crate::error::{Error, Result};
use crate::models::{
    BuildMetadata, Document, Environment, EnvironmentKey, NewRun, Run, RunClaim, RunFailure,
    RunSuccess,
};
use crate::retry::RetryPolicy;

/// Run record as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
struct RunRow {
    id: String,
    workspace_id: String,
    configuration_id: String,
    input_document_id: String,
    engine_spec: String,
    dependency_digest: String,
    status: String,
    attempt_count: i32,
    max_attempts: i32,
    lease_owner: Option<String>,
    lease_token: Option<Uuid>,
    lease_expires_at: Option<DateTime<Utc>>,
    next_due_at: Option<DateTime<Utc>>,
    run_options: Value,
    environment_id: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    error_message: Option<String>,
    output_path: Option<String>,
    summary: Option<Value>,
}

impl TryFrom<RunRow> for Run {
    type Error = Error;

    fn try_from(row: RunRow) -> Result<Self> {
        Ok(Run {
            status: row.status.parse().map_err(Error::Other)?,
            id: row.id,
            workspace_id: row.workspace_id,
            configuration_id: row.configuration_id,
            input_document_id: row.input_document_id,
            engine_spec: row.engine_spec,
            dependency_digest: row.dependency_digest,
            attempt_count: row.attempt_count,
            max_attempts: row.max_attempts,
            lease_owner: row.lease_owner,
            lease_token: row.lease_token,
            lease_expires_at: row.lease_expires_at,
            next_due_at: row.next_due_at,
            run_options: row.run_options,
            environment_id: row.environment_id,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            exit_code: row.exit_code,
            error_message: row.error_message,
            output_path: row.output_path,
            summary: row.summary,
        })
    }
}

/// Environment record as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
struct EnvironmentRow {
    id: String,
    workspace_id: String,
    configuration_id: String,
    engine_spec: String,
    dependency_digest: String,
    status: String,
    build_generation: i32,
    python_interpreter: Option<String>,
    python_version: Option<String>,
    engine_version: Option<String>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_used_at: Option<DateTime<Utc>>,
}

impl TryFrom<EnvironmentRow> for Environment {
    type Error = Error;

    fn try_from(row: EnvironmentRow) -> Result<Self> {
        Ok(Environment {
            status: row.status.parse().map_err(Error::Other)?,
            id: row.id,
            workspace_id: row.workspace_id,
            configuration_id: row.configuration_id,
            engine_spec: row.engine_spec,
            dependency_digest: row.dependency_digest,
            build_generation: row.build_generation,
            python_interpreter: row.python_interpreter,
            python_version: row.python_version,
            engine_version: row.engine_version,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_used_at: row.last_used_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct DocumentRow {
    id: String,
    workspace_id: String,
    original_filename: String,
    stored_path: String,
    deleted_at: Option<DateTime<Utc>>,
}

impl From<DocumentRow> for Document {
    fn from(row: DocumentRow) -> Self {
        Document {
            id: row.id,
            workspace_id: row.workspace_id,
            original_filename: row.original_filename,
            stored_path: row.stored_path,
            deleted_at: row.deleted_at,
        }
    }
}

const RUN_COLUMNS: &str = r#"
    id, workspace_id, configuration_id, input_document_id, engine_spec, dependency_digest,
    status, attempt_count, max_attempts, lease_owner, lease_token, lease_expires_at,
    next_due_at, run_options, environment_id, created_at, started_at, completed_at,
    exit_code, error_message, output_path, summary
"#;

const ENVIRONMENT_COLUMNS: &str = r#"
    id, workspace_id, configuration_id, engine_spec, dependency_digest, status,
    build_generation, python_interpreter, python_version, engine_version, error_message,
    created_at, updated_at, last_used_at
"#;

/// Lease store backed by PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgLeaseStore {
    pool: PgPool,
}

impl PgLeaseStore {
    /// Create a store over `pool`. Migrations must have been applied.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a queued run (producer side). The queue trigger wakes listeners.
    pub async fn enqueue_run(&self, run: &NewRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runs (
                id, workspace_id, configuration_id, input_document_id, engine_spec,
                dependency_digest, status, max_attempts, run_options, next_due_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'queued', $7, $8, $9)
            "#,
        )
        .bind(&run.id)
        .bind(&run.workspace_id)
        .bind(&run.configuration_id)
        .bind(&run.input_document_id)
        .bind(&run.engine_spec)
        .bind(&run.dependency_digest)
        .bind(run.max_attempts)
        .bind(run.run_options.clone())
        .bind(run.next_due_at)
        .execute(&self.pool)
        .await?;

        debug!(run_id = %run.id, "Run enqueued");
        Ok(())
    }

    /// Record an uploaded document (producer side).
    pub async fn insert_document(&self, document: &Document) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, workspace_id, original_filename, stored_path, deleted_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&document.id)
        .bind(&document.workspace_id)
        .bind(&document.original_filename)
        .bind(&document.stored_path)
        .bind(document.deleted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for PgLeaseStore {
    async fn claim_runs(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_seconds: i64,
        limit: usize,
    ) -> Result<Vec<RunClaim>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM runs
                WHERE (status = 'queued' AND (next_due_at IS NULL OR next_due_at <= $2))
                   OR (status = 'running'
                       AND lease_expires_at <= $2
                       AND attempt_count < max_attempts)
                ORDER BY COALESCE(next_due_at, created_at), created_at
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            UPDATE runs AS r
            SET status = 'running',
                lease_owner = $1,
                lease_token = gen_random_uuid(),
                lease_expires_at = $3,
                attempt_count = r.attempt_count + 1,
                started_at = COALESCE(r.started_at, $2),
                next_due_at = NULL
            FROM claimable
            WHERE r.id = claimable.id
            RETURNING r.id, r.attempt_count, r.max_attempts, r.lease_token
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .bind(now + Duration::seconds(lease_seconds))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let claims = rows
            .iter()
            .map(|row| {
                Ok(RunClaim {
                    run_id: row.try_get("id")?,
                    attempt_count: row.try_get("attempt_count")?,
                    max_attempts: row.try_get("max_attempts")?,
                    lease_token: row.try_get("lease_token")?,
                })
            })
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()?;

        if !claims.is_empty() {
            debug!(worker_id = %worker_id, count = claims.len(), "Claimed runs");
        }
        Ok(claims)
    }

    async fn heartbeat_run(
        &self,
        run_id: &str,
        worker_id: &str,
        lease_token: Uuid,
        now: DateTime<Utc>,
        lease_seconds: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET lease_expires_at = $5
            WHERE id = $1
              AND lease_owner = $2
              AND lease_token = $3
              AND status = 'running'
              AND lease_expires_at > $4
            "#,
        )
        .bind(run_id)
        .bind(worker_id)
        .bind(lease_token)
        .bind(now)
        .bind(now + Duration::seconds(lease_seconds))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn ack_run_success(
        &self,
        run_id: &str,
        worker_id: &str,
        lease_token: Uuid,
        now: DateTime<Utc>,
        success: &RunSuccess,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = 'succeeded',
                completed_at = $4,
                exit_code = $5,
                output_path = $6,
                summary = $7,
                environment_id = COALESCE($8, environment_id),
                error_message = NULL,
                lease_owner = NULL,
                lease_token = NULL,
                lease_expires_at = NULL,
                next_due_at = NULL
            WHERE id = $1
              AND lease_owner = $2
              AND lease_token = $3
              AND status = 'running'
              AND lease_expires_at > $4
            "#,
        )
        .bind(run_id)
        .bind(worker_id)
        .bind(lease_token)
        .bind(now)
        .bind(success.exit_code)
        .bind(success.output_path.as_deref())
        .bind(success.summary.clone())
        .bind(success.environment_id.as_deref())
        .execute(&self.pool)
        .await?;

        let acked = result.rows_affected() == 1;
        if acked {
            info!(run_id = %run_id, "Run succeeded");
        }
        Ok(acked)
    }

    async fn ack_run_failure(
        &self,
        run_id: &str,
        worker_id: &str,
        lease_token: Uuid,
        now: DateTime<Utc>,
        failure: &RunFailure,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = CASE WHEN $6::timestamptz IS NULL THEN 'failed' ELSE 'queued' END,
                next_due_at = $6,
                completed_at = CASE WHEN $6::timestamptz IS NULL THEN $4 ELSE NULL END,
                exit_code = $5,
                error_message = $7,
                lease_owner = NULL,
                lease_token = NULL,
                lease_expires_at = NULL
            WHERE id = $1
              AND lease_owner = $2
              AND lease_token = $3
              AND status = 'running'
              AND lease_expires_at > $4
            "#,
        )
        .bind(run_id)
        .bind(worker_id)
        .bind(lease_token)
        .bind(now)
        .bind(failure.exit_code)
        .bind(failure.retry_at)
        .bind(&failure.error_message)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn expire_run_leases(&self, now: DateTime<Utc>, retry: &RetryPolicy) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let expired = sqlx::query(
            r#"
            SELECT id, attempt_count, max_attempts
            FROM runs
            WHERE status = 'running' AND lease_expires_at <= $1
            ORDER BY lease_expires_at
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        let mut swept = 0u64;
        for row in &expired {
            let run_id: String = row.try_get("id")?;
            let attempt_count: i32 = row.try_get("attempt_count")?;
            let max_attempts: i32 = row.try_get("max_attempts")?;

            let message = format!("Lease expired during attempt {}", attempt_count);
            match retry.retry_at(now, attempt_count, max_attempts) {
                Some(retry_at) => {
                    sqlx::query(
                        r#"
                        UPDATE runs
                        SET status = 'queued',
                            next_due_at = $2,
                            error_message = $3,
                            lease_owner = NULL,
                            lease_token = NULL,
                            lease_expires_at = NULL
                        WHERE id = $1
                        "#,
                    )
                    .bind(&run_id)
                    .bind(retry_at)
                    .bind(&message)
                    .execute(&mut *tx)
                    .await?;
                    warn!(run_id = %run_id, attempt_count, retry_at = %retry_at, "Lease expired, run requeued");
                }
                None => {
                    sqlx::query(
                        r#"
                        UPDATE runs
                        SET status = 'failed',
                            completed_at = $2,
                            error_message = $3,
                            lease_owner = NULL,
                            lease_token = NULL,
                            lease_expires_at = NULL
                        WHERE id = $1
                        "#,
                    )
                    .bind(&run_id)
                    .bind(now)
                    .bind(&message)
                    .execute(&mut *tx)
                    .await?;
                    warn!(run_id = %run_id, attempt_count, "Lease expired on final attempt, run failed");
                }
            }
            swept += 1;
        }

        tx.commit().await?;
        Ok(swept)
    }

    async fn next_due_at(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let next = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT MIN(next_due_at) FROM runs WHERE status = 'queued' AND next_due_at > $1",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(next)
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {} FROM runs WHERE id = $1",
            RUN_COLUMNS
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Run::try_from).transpose()
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<Document>> {
        let row = sqlx::query_as::<_, DocumentRow>(
            r#"
            SELECT id, workspace_id, original_filename, stored_path, deleted_at
            FROM documents
            WHERE id = $1
            "#,
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Document::from))
    }

    async fn get_or_create_environment(
        &self,
        key: &EnvironmentKey,
        now: DateTime<Utc>,
    ) -> Result<Environment> {
        sqlx::query(
            r#"
            INSERT INTO environments (
                id, workspace_id, configuration_id, engine_spec, dependency_digest,
                status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, 'queued', $6, $6)
            ON CONFLICT (workspace_id, configuration_id, engine_spec, dependency_digest)
            DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&key.workspace_id)
        .bind(&key.configuration_id)
        .bind(&key.engine_spec)
        .bind(&key.dependency_digest)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, EnvironmentRow>(&format!(
            r#"
            SELECT {} FROM environments
            WHERE workspace_id = $1
              AND configuration_id = $2
              AND engine_spec = $3
              AND dependency_digest = $4
            "#,
            ENVIRONMENT_COLUMNS
        ))
        .bind(&key.workspace_id)
        .bind(&key.configuration_id)
        .bind(&key.engine_spec)
        .bind(&key.dependency_digest)
        .fetch_one(&self.pool)
        .await?;
        Environment::try_from(row)
    }

    async fn get_environment(&self, environment_id: &str) -> Result<Option<Environment>> {
        let row = sqlx::query_as::<_, EnvironmentRow>(&format!(
            "SELECT {} FROM environments WHERE id = $1",
            ENVIRONMENT_COLUMNS
        ))
        .bind(environment_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Environment::try_from).transpose()
    }

    async fn mark_environment_building(
        &self,
        environment_id: &str,
        now: DateTime<Utc>,
    ) -> Result<i32> {
        let generation = sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE environments
            SET status = 'building',
                build_generation = build_generation + 1,
                error_message = NULL,
                updated_at = $2
            WHERE id = $1
            RETURNING build_generation
            "#,
        )
        .bind(environment_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        generation.ok_or_else(|| Error::Other(format!("Environment not found: {}", environment_id)))
    }

    async fn mark_environment_ready(
        &self,
        environment_id: &str,
        metadata: &BuildMetadata,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE environments
            SET status = 'ready',
                python_interpreter = $2,
                python_version = $3,
                engine_version = $4,
                error_message = NULL,
                updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(environment_id)
        .bind(&metadata.python_interpreter)
        .bind(&metadata.python_version)
        .bind(&metadata.engine_version)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_environment_failed(
        &self,
        environment_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE environments
            SET status = 'failed', error_message = $2, updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(environment_id)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_environment(&self, environment_id: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE environments SET last_used_at = $2 WHERE id = $1")
            .bind(environment_id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn try_lock(&self, key: &str) -> Result<Option<Box<dyn EnvironmentLock>>> {
        let lock_id = advisory_lock_id(key);
        let mut conn = self.pool.acquire().await?;

        let acquired = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
            .bind(lock_id)
            .fetch_one(&mut *conn)
            .await?;

        if !acquired {
            return Ok(None);
        }
        debug!(lock_key = %key, lock_id, "Advisory lock acquired");
        Ok(Some(Box::new(PgAdvisoryLock {
            key: key.to_string(),
            lock_id,
            conn: Some(conn),
        })))
    }
}

/// Session-level advisory lock pinned to one pooled connection.
struct PgAdvisoryLock {
    key: String,
    lock_id: i64,
    conn: Option<PoolConnection<Postgres>>,
}

#[async_trait]
impl EnvironmentLock for PgAdvisoryLock {
    fn key(&self) -> &str {
        &self.key
    }

    async fn release(self: Box<Self>) -> Result<()> {
        let mut this = self;
        let Some(mut conn) = this.conn.take() else {
            return Ok(());
        };

        let unlocked = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(this.lock_id)
            .fetch_one(&mut *conn)
            .await;

        match unlocked {
            Ok(true) => {
                debug!(lock_key = %this.key, "Advisory lock released");
                Ok(())
            }
            Ok(false) => {
                warn!(lock_key = %this.key, "Advisory lock was not held at release");
                conn.close_on_drop();
                Ok(())
            }
            Err(e) => {
                // Closing the session frees the lock.
                conn.close_on_drop();
                Err(e.into())
            }
        }
    }
}

impl Drop for PgAdvisoryLock {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            warn!(lock_key = %self.key, "Advisory lock dropped without release, closing connection");
            conn.close_on_drop();
        }
    }
}
