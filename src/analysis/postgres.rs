//! Postgres-backed analysis stores.
//!
//! # Tables
//! - `analysis_cache`: one row per scope, keyed by [`AnalysisScope::cache_key`]
//! - `analysis_jobs`: one row per computation attempt; a partial unique index
//!   allows at most one `queued`/`running` row per scope
//! - `analysis_job_queue`: pending job ids, claimed with `SKIP LOCKED`

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use super::error::{AnalysisError, Result};
use super::models::{AnalysisScope, CacheRecord, CacheStatus, Job, JobCreation, JobStatus};
use super::storage::{CacheStore, JobTracker, WorkQueue};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS analysis_cache (
        scope_key TEXT PRIMARY KEY,
        scope JSONB NOT NULL,
        analysis_text TEXT,
        content_hash TEXT NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('ready', 'stale')),
        computed_at TIMESTAMPTZ,
        error_message TEXT,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS analysis_jobs (
        job_id UUID PRIMARY KEY,
        scope_key TEXT NOT NULL,
        scope JSONB NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('queued', 'running', 'completed', 'failed')),
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        error_message TEXT
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_analysis_jobs_scope_status
        ON analysis_jobs (scope_key, status)
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_analysis_jobs_one_in_flight
        ON analysis_jobs (scope_key)
        WHERE status IN ('queued', 'running')
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS analysis_job_queue (
        job_id UUID PRIMARY KEY REFERENCES analysis_jobs (job_id),
        enqueued_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_analysis_job_queue_enqueued
        ON analysis_job_queue (enqueued_at)
    "#,
];

/// Create the analysis tables and indexes if they do not exist.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    info!("Analysis schema is up to date");
    Ok(())
}

fn row_to_cache_record(row: &PgRow) -> Result<CacheRecord> {
    let scope: Json<AnalysisScope> = row.try_get("scope")?;
    let status: String = row.try_get("status")?;

    Ok(CacheRecord {
        scope: scope.0,
        analysis_text: row.try_get("analysis_text")?,
        content_hash: row.try_get("content_hash")?,
        status: status.parse::<CacheStatus>()?,
        computed_at: row.try_get("computed_at")?,
        error_message: row.try_get("error_message")?,
    })
}

fn row_to_job(row: &PgRow) -> Result<Job> {
    let scope: Json<AnalysisScope> = row.try_get("scope")?;
    let status: String = row.try_get("status")?;

    Ok(Job {
        job_id: row.try_get("job_id")?,
        scope: scope.0,
        status: status.parse::<JobStatus>()?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        error_message: row.try_get("error_message")?,
    })
}

pub struct PgCacheStore {
    pool: PgPool,
}

impl PgCacheStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CacheStore for PgCacheStore {
    async fn get(&self, scope: &AnalysisScope) -> Result<Option<CacheRecord>> {
        let row = sqlx::query(
            r#"
            SELECT scope, analysis_text, content_hash, status, computed_at, error_message
            FROM analysis_cache
            WHERE scope_key = $1
            "#,
        )
        .bind(scope.cache_key())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_cache_record).transpose()
    }

    async fn record_success(
        &self,
        job_id: Uuid,
        scope: &AnalysisScope,
        analysis_text: &str,
        content_hash: &str,
        computed_at: DateTime<Utc>,
    ) -> Result<Option<CacheRecord>> {
        let mut tx = self.pool.begin().await?;

        // Holds the job row lock until commit, so the watchdog cannot fail the
        // job between this check and the cache write.
        let completed = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET status = 'completed', updated_at = NOW()
            WHERE job_id = $1 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        if completed.rows_affected() == 0 {
            tx.rollback().await?;
            debug!(%job_id, "Job no longer running, analysis for {} discarded", scope);
            return Ok(None);
        }

        let row = sqlx::query(
            r#"
            INSERT INTO analysis_cache
                (scope_key, scope, analysis_text, content_hash, status, computed_at, error_message, updated_at)
            VALUES ($1, $2, $3, $4, 'ready', $5, NULL, NOW())
            ON CONFLICT (scope_key) DO UPDATE
            SET analysis_text = EXCLUDED.analysis_text,
                content_hash = EXCLUDED.content_hash,
                status = 'ready',
                computed_at = EXCLUDED.computed_at,
                error_message = NULL,
                updated_at = NOW()
            RETURNING scope, analysis_text, content_hash, status, computed_at, error_message
            "#,
        )
        .bind(scope.cache_key())
        .bind(Json(scope))
        .bind(analysis_text)
        .bind(content_hash)
        .bind(computed_at)
        .fetch_one(&mut *tx)
        .await?;
        let record = row_to_cache_record(&row)?;

        tx.commit().await?;
        debug!("Stored analysis for {}", scope);
        Ok(Some(record))
    }

    async fn record_failure(&self, scope: &AnalysisScope, error_message: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE analysis_cache
            SET status = 'stale', error_message = $2, updated_at = NOW()
            WHERE scope_key = $1
            "#,
        )
        .bind(scope.cache_key())
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

pub struct PgJobTracker {
    pool: PgPool,
}

impl PgJobTracker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobTracker for PgJobTracker {
    async fn create_queued(&self, scope: &AnalysisScope) -> Result<JobCreation> {
        let job = Job::queued(scope.clone());

        let inserted = sqlx::query(
            r#"
            INSERT INTO analysis_jobs (job_id, scope_key, scope, status, created_at, updated_at)
            VALUES ($1, $2, $3, 'queued', $4, $4)
            ON CONFLICT (scope_key) WHERE status IN ('queued', 'running') DO NOTHING
            "#,
        )
        .bind(job.job_id)
        .bind(scope.cache_key())
        .bind(Json(scope))
        .bind(job.created_at)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 1 {
            return Ok(JobCreation::Created(job));
        }

        // Lost the race to a concurrent request; report the winner.
        match self.find_in_flight(scope).await? {
            Some(existing) => Ok(JobCreation::AlreadyInFlight(existing)),
            // The winner finished between the insert and the read.
            None => self.create_queued(scope).await,
        }
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"
            SELECT job_id, scope, status, created_at, updated_at, error_message
            FROM analysis_jobs
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_job).transpose()
    }

    async fn find_in_flight(&self, scope: &AnalysisScope) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"
            SELECT job_id, scope, status, created_at, updated_at, error_message
            FROM analysis_jobs
            WHERE scope_key = $1 AND status IN ('queued', 'running')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(scope.cache_key())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_job).transpose()
    }

    async fn transition(
        &self,
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
        error_message: Option<&str>,
    ) -> Result<bool> {
        if !from.can_transition_to(to) {
            return Err(AnalysisError::InvalidTransition { job_id, from, to });
        }

        let result = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET status = $3,
                error_message = COALESCE($4, error_message),
                updated_at = NOW()
            WHERE job_id = $1 AND status = $2
            "#,
        )
        .bind(job_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        match self.get(job_id).await? {
            Some(_) => Ok(false),
            None => Err(AnalysisError::NotFound { job_id }),
        }
    }

    async fn expire_running(
        &self,
        cutoff: DateTime<Utc>,
        error_message: &str,
    ) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET status = 'failed', error_message = $2, updated_at = NOW()
            WHERE status = 'running' AND updated_at < $1
            RETURNING job_id
            "#,
        )
        .bind(cutoff)
        .bind(error_message)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<Uuid, _>("job_id").map_err(AnalysisError::from))
            .collect()
    }

    async fn queued_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT job_id FROM analysis_jobs
            WHERE status = 'queued' AND created_at < $1
            ORDER BY created_at
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

pub struct PgWorkQueue {
    pool: PgPool,
}

impl PgWorkQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkQueue for PgWorkQueue {
    async fn enqueue(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO analysis_job_queue (job_id, enqueued_at)
            VALUES ($1, NOW())
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Uuid>> {
        let job_id = sqlx::query_scalar::<_, Uuid>(
            r#"
            DELETE FROM analysis_job_queue
            WHERE job_id = (
                SELECT job_id FROM analysis_job_queue
                ORDER BY enqueued_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING job_id
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(job_id)
    }
}
