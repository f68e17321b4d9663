//! Persistence seams for analysis state.
//!
//! Three stores back the service: the cache of last computed analyses, the
//! job registry, and the work queue connecting the coordinator to workers.
//! Production wiring uses the Postgres implementations in
//! [`super::postgres`]; [`super::in_memory`] backs tests and single-process
//! development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use super::error::Result;
use super::models::{AnalysisScope, CacheRecord, Job, JobCreation, JobStatus};

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, scope: &AnalysisScope) -> Result<Option<CacheRecord>>;

    /// Upsert a fresh analysis for `scope` and move `job_id` from `running`
    /// to `completed`, as one atomic step. Returns `None` and writes nothing
    /// when the job is no longer `running`.
    async fn record_success(
        &self,
        job_id: Uuid,
        scope: &AnalysisScope,
        analysis_text: &str,
        content_hash: &str,
        computed_at: DateTime<Utc>,
    ) -> Result<Option<CacheRecord>>;

    /// Annotate an existing record with a failure. Never inserts and never
    /// touches `analysis_text`, `content_hash` or `computed_at`.
    async fn record_failure(&self, scope: &AnalysisScope, error_message: &str) -> Result<()>;
}

#[async_trait]
pub trait JobTracker: Send + Sync {
    /// Create a queued job unless one is already in flight for the scope.
    async fn create_queued(&self, scope: &AnalysisScope) -> Result<JobCreation>;

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>>;

    async fn find_in_flight(&self, scope: &AnalysisScope) -> Result<Option<Job>>;

    /// Move `job_id` from `from` to `to`. Returns `false` without changing
    /// anything when the job is not currently in `from`.
    async fn transition(
        &self,
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
        error_message: Option<&str>,
    ) -> Result<bool>;

    /// Fail every `running` job last updated before `cutoff`.
    async fn expire_running(&self, cutoff: DateTime<Utc>, error_message: &str)
        -> Result<Vec<Uuid>>;

    /// Ids of jobs still `queued` that were created before `cutoff`.
    async fn queued_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>>;
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, job_id: Uuid) -> Result<()>;

    /// Take the oldest pending job id, if any.
    async fn dequeue(&self) -> Result<Option<Uuid>>;
}

/// The three stores, shared by coordinator, worker and watchdog.
#[derive(Clone)]
pub struct AnalysisStores {
    pub cache: Arc<dyn CacheStore>,
    pub jobs: Arc<dyn JobTracker>,
    pub queue: Arc<dyn WorkQueue>,
}

impl AnalysisStores {
    pub fn postgres(pool: sqlx::PgPool) -> Self {
        use super::postgres::{PgCacheStore, PgJobTracker, PgWorkQueue};

        Self {
            cache: Arc::new(PgCacheStore::new(pool.clone())),
            jobs: Arc::new(PgJobTracker::new(pool.clone())),
            queue: Arc::new(PgWorkQueue::new(pool)),
        }
    }

    pub fn in_memory() -> Self {
        use super::in_memory::{InMemoryCacheStore, InMemoryJobTracker, InMemoryWorkQueue};

        let jobs = Arc::new(InMemoryJobTracker::default());
        Self {
            cache: Arc::new(InMemoryCacheStore::new(jobs.clone())),
            jobs,
            queue: Arc::new(InMemoryWorkQueue::default()),
        }
    }
}
