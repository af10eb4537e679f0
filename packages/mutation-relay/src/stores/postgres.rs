//! PostgreSQL queue backend.
//!
//! [`PgOutboxWriter`] writes dispatch records through the caller's
//! `sqlx::Transaction`, so the record commits with the mutation.
//! [`PgJobStore`] claims with `FOR UPDATE SKIP LOCKED`, so any number of
//! workers can share the table.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, Postgres};
use sqlx::{FromRow, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::job::{retry_delay, ClaimedJob, FailureKind, JobRecord, JobStore};
use crate::outbox::OutboxWriter;

const CREATE_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS relay_jobs (
    id UUID PRIMARY KEY,
    kind TEXT NOT NULL,
    queue TEXT NOT NULL,
    args JSONB NOT NULL,
    state TEXT NOT NULL DEFAULT 'available',
    attempt INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    scheduled_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    lease_expires_at TIMESTAMPTZ,
    worker_id TEXT,
    last_error TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    finalized_at TIMESTAMPTZ
)
"#;

const CREATE_FETCH_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS relay_jobs_fetch_idx
    ON relay_jobs (queue, state, scheduled_at)
    WHERE state IN ('available', 'retryable', 'running')
"#;

/// Create the queue table if it does not exist.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::query(CREATE_JOBS_TABLE)
        .execute(pool)
        .await
        .context("failed to create relay_jobs table")?;
    sqlx::query(CREATE_FETCH_INDEX)
        .execute(pool)
        .await
        .context("failed to create relay_jobs index")?;
    Ok(())
}

/// Outbox writer bound to an open transaction.
pub struct PgOutboxWriter<'a, 'c> {
    tx: &'a mut Transaction<'c, Postgres>,
}

impl<'a, 'c> PgOutboxWriter<'a, 'c> {
    pub fn new(tx: &'a mut Transaction<'c, Postgres>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl<'a, 'c> OutboxWriter for PgOutboxWriter<'a, 'c> {
    async fn enqueue(&mut self, record: JobRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO relay_jobs (id, kind, queue, args, max_attempts, scheduled_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(record.id)
        .bind(&record.kind)
        .bind(&record.queue)
        .bind(&record.args)
        .bind(record.max_attempts)
        .bind(record.scheduled_at)
        .execute(&mut **self.tx)
        .await
        .with_context(|| format!("failed to insert job {}", record.id))?;

        debug!(job_id = %record.id, queue = %record.queue, "outbox record inserted");
        Ok(())
    }
}

#[derive(FromRow)]
struct ClaimedRow {
    id: Uuid,
    kind: String,
    queue: String,
    args: serde_json::Value,
    attempt: i32,
    max_attempts: i32,
}

impl From<ClaimedRow> for ClaimedJob {
    fn from(row: ClaimedRow) -> Self {
        Self {
            id: row.id,
            kind: row.kind,
            queue: row.queue,
            args: row.args,
            attempt: row.attempt,
            max_attempts: row.max_attempts,
        }
    }
}

/// Job store over the `relay_jobs` table.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
    lease_ms: i64,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lease_ms: 60_000,
        }
    }

    pub fn with_lease_ms(mut self, lease_ms: i64) -> Self {
        self.lease_ms = lease_ms;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl std::fmt::Debug for PgJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgJobStore")
            .field("lease_ms", &self.lease_ms)
            .finish()
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn claim_ready(&self, worker_id: &str, queue: &str, limit: i64) -> Result<Vec<ClaimedJob>> {
        let rows = sqlx::query_as::<_, ClaimedRow>(
            r#"
            WITH next_jobs AS (
                SELECT id
                FROM relay_jobs
                WHERE queue = $1
                  AND (
                    (state IN ('available', 'retryable') AND scheduled_at <= NOW())
                    OR (state = 'running' AND lease_expires_at < NOW())
                  )
                ORDER BY scheduled_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE relay_jobs
            SET state = 'running',
                attempt = attempt + 1,
                lease_expires_at = NOW() + ($3 || ' milliseconds')::INTERVAL,
                worker_id = $4
            WHERE id IN (SELECT id FROM next_jobs)
            RETURNING id, kind, queue, args, attempt, max_attempts
            "#,
        )
        .bind(queue)
        .bind(limit)
        .bind(self.lease_ms.to_string())
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to claim jobs")?;

        Ok(rows.into_iter().map(ClaimedJob::from).collect())
    }

    async fn mark_succeeded(&self, job_id: Uuid, worker_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE relay_jobs
            SET state = 'completed',
                lease_expires_at = NULL,
                finalized_at = NOW()
            WHERE id = $1 AND worker_id = $2 AND state = 'running'
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to complete job {}", job_id))?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        kind: FailureKind,
    ) -> Result<bool> {
        let held: Option<(i32, i32)> = sqlx::query_as(
            r#"
            SELECT attempt, max_attempts
            FROM relay_jobs
            WHERE id = $1 AND worker_id = $2 AND state = 'running'
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to load job {}", job_id))?;

        let Some((attempt, max_attempts)) = held else {
            return Ok(false);
        };

        // `attempt` pins the update to this claim; a re-claim bumps it.
        let result = if kind == FailureKind::Retryable && attempt < max_attempts {
            let retry_at = chrono::Utc::now() + retry_delay(attempt);
            sqlx::query(
                r#"
                UPDATE relay_jobs
                SET state = 'retryable',
                    scheduled_at = $1,
                    last_error = $2,
                    lease_expires_at = NULL
                WHERE id = $3 AND worker_id = $4 AND state = 'running' AND attempt = $5
                "#,
            )
            .bind(retry_at)
            .bind(error)
            .bind(job_id)
            .bind(worker_id)
            .bind(attempt)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE relay_jobs
                SET state = 'discarded',
                    last_error = $1,
                    lease_expires_at = NULL,
                    finalized_at = NOW()
                WHERE id = $2 AND worker_id = $3 AND state = 'running' AND attempt = $4
                "#,
            )
            .bind(error)
            .bind(job_id)
            .bind(worker_id)
            .bind(attempt)
            .execute(&self.pool)
            .await?
        };

        Ok(result.rows_affected() == 1)
    }

    async fn heartbeat(&self, job_id: Uuid, worker_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE relay_jobs
            SET lease_expires_at = NOW() + ($1 || ' milliseconds')::INTERVAL
            WHERE id = $2 AND worker_id = $3 AND state = 'running'
            "#,
        )
        .bind(self.lease_ms.to_string())
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
