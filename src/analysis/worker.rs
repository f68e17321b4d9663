//! Background worker: turns queued jobs into cached analyses.
//!
//! Each job runs `queued -> running -> completed | failed`. The `queued ->
//! running` step is a conditional update, so a job delivered twice is
//! processed once; the second delivery observes a non-queued job and is
//! skipped without calling the generator or writing the cache.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::conversations::ConversationStore;
use super::error::{AnalysisError, Result};
use super::generator::{Generator, GeneratorError};
use super::hashing::content_hash;
use super::metrics::AnalysisMetrics;
use super::models::{ConversationMessage, Job, JobStatus};
use super::storage::AnalysisStores;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Jobs processed at the same time by one worker process
    pub concurrency: usize,
    /// Sleep between polls of an empty queue
    pub idle_poll_interval_ms: u64,
    /// Hard limit on one generator call
    pub generation_timeout_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            idle_poll_interval_ms: 1000,
            generation_timeout_seconds: 300,
        }
    }
}

/// What happened to one dispatched job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// The scope had no messages; the cache was left alone.
    CompletedEmpty,
    Failed(String),
    /// Duplicate delivery of a job that is no longer queued.
    Skipped,
    /// The job left `running` (expired by the watchdog) before its result
    /// arrived; the result was discarded and the cache left alone.
    Expired,
}

pub struct AnalysisWorker {
    conversations: Arc<dyn ConversationStore>,
    generator: Arc<dyn Generator>,
    stores: AnalysisStores,
    config: WorkerConfig,
    metrics: Option<Arc<AnalysisMetrics>>,
}

impl AnalysisWorker {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        generator: Arc<dyn Generator>,
        stores: AnalysisStores,
        config: WorkerConfig,
    ) -> Self {
        Self {
            conversations,
            generator,
            stores,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<AnalysisMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Process one dispatched job to a terminal state.
    #[instrument(skip(self))]
    pub async fn process_job(&self, job_id: Uuid) -> Result<JobOutcome> {
        let job = self
            .stores
            .jobs
            .get(job_id)
            .await?
            .ok_or(AnalysisError::NotFound { job_id })?;

        if job.status != JobStatus::Queued {
            return Ok(self.skip(&job));
        }

        if !self
            .stores
            .jobs
            .transition(job_id, JobStatus::Queued, JobStatus::Running, None)
            .await?
        {
            return Ok(self.skip(&job));
        }
        info!("Processing analysis job for {}", job.scope);

        let messages = match self.conversations.get_messages(&job.scope).await {
            Ok(messages) => messages,
            Err(e) => {
                let message = format!("conversation data unavailable: {e}");
                return self.fail(&job, message).await;
            }
        };

        if messages.is_empty() {
            self.finish(&job).await?;
            debug!("No conversations for {}, cache left unchanged", job.scope);
            return Ok(JobOutcome::CompletedEmpty);
        }

        let transcript = build_transcript(&messages);
        let analysis = match self.generate(&transcript).await {
            Ok(analysis) => analysis,
            Err(e) => return self.fail(&job, e.to_string()).await,
        };

        let hash = content_hash(&messages);
        match self
            .stores
            .cache
            .record_success(job_id, &job.scope, &analysis, &hash, Utc::now())
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!(
                    %job_id,
                    "Job was no longer running when its analysis arrived, result discarded"
                );
                return Ok(JobOutcome::Expired);
            }
            Err(e) => {
                return self
                    .fail(&job, format!("failed to store analysis: {e}"))
                    .await;
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.jobs_completed_total.inc();
        }
        info!("Analysis for {} completed", job.scope);
        Ok(JobOutcome::Completed)
    }

    async fn generate(&self, transcript: &str) -> std::result::Result<String, GeneratorError> {
        let seconds = self.config.generation_timeout_seconds;
        let _timer = self
            .metrics
            .as_ref()
            .map(|m| m.generation_duration_seconds.start_timer());

        tokio::time::timeout(
            Duration::from_secs(seconds),
            self.generator.summarize(transcript),
        )
        .await
        .map_err(|_| GeneratorError::Timeout { seconds })?
    }

    async fn finish(&self, job: &Job) -> Result<()> {
        let moved = self
            .stores
            .jobs
            .transition(job.job_id, JobStatus::Running, JobStatus::Completed, None)
            .await?;
        if !moved {
            warn!(
                job_id = %job.job_id,
                "Job was no longer running when it completed"
            );
        }
        Ok(())
    }

    /// Fail the job first so pollers see the outcome, then annotate the cache.
    async fn fail(&self, job: &Job, message: String) -> Result<JobOutcome> {
        warn!(job_id = %job.job_id, "Analysis for {} failed: {}", job.scope, message);

        let moved = self
            .stores
            .jobs
            .transition(
                job.job_id,
                JobStatus::Running,
                JobStatus::Failed,
                Some(&message),
            )
            .await?;
        if !moved {
            // Already failed by the watchdog; a newer job may own the cache now.
            warn!(job_id = %job.job_id, "Job was no longer running when it failed");
            return Ok(JobOutcome::Expired);
        }

        if let Some(metrics) = &self.metrics {
            metrics.jobs_failed_total.inc();
        }

        if let Err(e) = self.stores.cache.record_failure(&job.scope, &message).await {
            error!(
                job_id = %job.job_id,
                "Failed to annotate cache for {}: {}", job.scope, e
            );
        }
        Ok(JobOutcome::Failed(message))
    }

    fn skip(&self, job: &Job) -> JobOutcome {
        debug!(
            job_id = %job.job_id,
            "Ignoring duplicate delivery of {} job", job.status
        );
        if let Some(metrics) = &self.metrics {
            metrics.jobs_skipped_total.inc();
        }
        JobOutcome::Skipped
    }

    /// Consume the work queue until `shutdown` flips to `true`, then wait for
    /// jobs already started.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let idle = Duration::from_millis(self.config.idle_poll_interval_ms);
        let mut tasks = JoinSet::new();

        info!(
            "Analysis worker started (concurrency {})",
            self.config.concurrency.max(1)
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            match self.stores.queue.dequeue().await {
                Ok(Some(job_id)) => {
                    let worker = Arc::clone(&self);
                    tasks.spawn(async move {
                        let _permit = permit;
                        if let Err(e) = worker.process_job(job_id).await {
                            error!(%job_id, "Failed to process job: {}", e);
                        }
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(idle) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!("Failed to dequeue analysis job: {}", e);
                    tokio::time::sleep(idle).await;
                }
            }

            while let Some(result) = tasks.try_join_next() {
                if let Err(e) = result {
                    error!("Analysis task aborted: {}", e);
                }
            }
        }

        info!("Analysis worker draining {} in-flight jobs", tasks.len());
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!("Analysis task aborted: {}", e);
            }
        }
        info!("Analysis worker stopped");
    }
}

/// Render messages as one line per message, in the order given.
pub fn build_transcript(messages: &[ConversationMessage]) -> String {
    messages
        .iter()
        .map(|m| {
            format!(
                "[{}] {}: {}",
                m.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
                if m.is_user { "Student" } else { "Assistant" },
                m.content.trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
