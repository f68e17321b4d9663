//! Process-local store implementations.
//!
//! State lives only as long as the process, so these are for tests and
//! single-process development. Each store serialises access through one
//! lock, which gives the same per-scope atomicity the Postgres statements do.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::error::{AnalysisError, Result};
use super::models::{AnalysisScope, CacheRecord, CacheStatus, Job, JobCreation, JobStatus};
use super::storage::{CacheStore, JobTracker, WorkQueue};

/// Shares the job tracker so a successful write and the job's completion
/// happen under the tracker's lock.
pub struct InMemoryCacheStore {
    records: RwLock<HashMap<String, CacheRecord>>,
    jobs: Arc<InMemoryJobTracker>,
}

impl InMemoryCacheStore {
    pub fn new(jobs: Arc<InMemoryJobTracker>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            jobs,
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, scope: &AnalysisScope) -> Result<Option<CacheRecord>> {
        Ok(self.records.read().await.get(&scope.cache_key()).cloned())
    }

    async fn record_success(
        &self,
        job_id: Uuid,
        scope: &AnalysisScope,
        analysis_text: &str,
        content_hash: &str,
        computed_at: DateTime<Utc>,
    ) -> Result<Option<CacheRecord>> {
        let mut jobs = self.jobs.jobs.write().await;
        let job = match jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Running => job,
            _ => return Ok(None),
        };

        let record = CacheRecord {
            scope: scope.clone(),
            analysis_text: Some(analysis_text.to_string()),
            content_hash: content_hash.to_string(),
            status: CacheStatus::Ready,
            computed_at: Some(computed_at),
            error_message: None,
        };

        self.records
            .write()
            .await
            .insert(scope.cache_key(), record.clone());
        job.status = JobStatus::Completed;
        job.updated_at = Utc::now();
        Ok(Some(record))
    }

    async fn record_failure(&self, scope: &AnalysisScope, error_message: &str) -> Result<()> {
        if let Some(record) = self.records.write().await.get_mut(&scope.cache_key()) {
            record.status = CacheStatus::Stale;
            record.error_message = Some(error_message.to_string());
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryJobTracker {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl InMemoryJobTracker {
    pub async fn all_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    pub async fn jobs_for(&self, scope: &AnalysisScope) -> Vec<Job> {
        self.all_jobs()
            .await
            .into_iter()
            .filter(|job| &job.scope == scope)
            .collect()
    }

    /// Rewind a job's `updated_at`, for exercising age-based sweeps.
    pub async fn backdate(&self, job_id: Uuid, updated_at: DateTime<Utc>) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(&job_id)
            .ok_or(AnalysisError::NotFound { job_id })?;
        job.updated_at = updated_at;
        job.created_at = job.created_at.min(updated_at);
        Ok(())
    }
}

#[async_trait]
impl JobTracker for InMemoryJobTracker {
    async fn create_queued(&self, scope: &AnalysisScope) -> Result<JobCreation> {
        let mut jobs = self.jobs.write().await;

        if let Some(existing) = jobs
            .values()
            .find(|job| &job.scope == scope && job.status.is_in_flight())
        {
            return Ok(JobCreation::AlreadyInFlight(existing.clone()));
        }

        let job = Job::queued(scope.clone());
        jobs.insert(job.job_id, job.clone());
        Ok(JobCreation::Created(job))
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(&job_id).cloned())
    }

    async fn find_in_flight(&self, scope: &AnalysisScope) -> Result<Option<Job>> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .find(|job| &job.scope == scope && job.status.is_in_flight())
            .cloned())
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

        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(&job_id)
            .ok_or(AnalysisError::NotFound { job_id })?;

        if job.status != from {
            return Ok(false);
        }

        job.status = to;
        job.updated_at = Utc::now();
        if let Some(message) = error_message {
            job.error_message = Some(message.to_string());
        }
        Ok(true)
    }

    async fn expire_running(
        &self,
        cutoff: DateTime<Utc>,
        error_message: &str,
    ) -> Result<Vec<Uuid>> {
        let mut jobs = self.jobs.write().await;
        let now = Utc::now();
        let mut expired = Vec::new();

        for job in jobs.values_mut() {
            if job.status == JobStatus::Running && job.updated_at < cutoff {
                job.status = JobStatus::Failed;
                job.error_message = Some(error_message.to_string());
                job.updated_at = now;
                expired.push(job.job_id);
            }
        }
        Ok(expired)
    }

    async fn queued_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| job.status == JobStatus::Queued && job.created_at < cutoff)
            .map(|job| job.job_id)
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryWorkQueue {
    pending: Mutex<VecDeque<Uuid>>,
}

impl InMemoryWorkQueue {
    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(&self, job_id: Uuid) -> Result<()> {
        let mut pending = self.pending.lock().await;
        if !pending.contains(&job_id) {
            pending.push_back(job_id);
        }
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Uuid>> {
        Ok(self.pending.lock().await.pop_front())
    }
}
