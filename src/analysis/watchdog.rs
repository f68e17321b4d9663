//! Stuck-job recovery.
//!
//! A worker that crashes mid-run leaves its job `running` forever, and a
//! coordinator that fails between creating and enqueueing a job leaves it
//! `queued` with nothing to pick it up. The watchdog periodically:
//! - fails `running` jobs not updated within `job_timeout_seconds`
//! - re-enqueues `queued` jobs older than `requeue_after_seconds`
//!
//! Re-enqueueing a job that is also still in the queue is harmless: the
//! worker skips deliveries of jobs that are no longer `queued`.
//!
//! Both thresholds are deployment settings.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::error::{AnalysisError, Result};
use super::metrics::AnalysisMetrics;
use super::storage::AnalysisStores;

/// Upper bound for both watchdog thresholds (30 days).
pub const MAX_THRESHOLD_SECONDS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    pub enabled: bool,
    /// Cron expression with seconds (default: every minute)
    pub cron_expression: String,
    /// Running jobs idle longer than this are failed
    pub job_timeout_seconds: u64,
    /// Queued jobs older than this are dispatched again
    pub requeue_after_seconds: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cron_expression: "0 * * * * *".to_string(),
            job_timeout_seconds: 900,
            requeue_after_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub expired: Vec<Uuid>,
    pub requeued: Vec<Uuid>,
}

pub struct JobWatchdog {
    stores: AnalysisStores,
    config: WatchdogConfig,
    metrics: Option<Arc<AnalysisMetrics>>,
    scheduler: Option<JobScheduler>,
    sweeping: Arc<Mutex<()>>,
}

impl JobWatchdog {
    pub fn new(stores: AnalysisStores, config: WatchdogConfig) -> Self {
        Self {
            stores,
            config,
            metrics: None,
            scheduler: None,
            sweeping: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<AnalysisMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run one recovery pass.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<SweepReport> {
        Self::sweep_with(&self.stores, &self.config, self.metrics.as_deref()).await
    }

    async fn sweep_with(
        stores: &AnalysisStores,
        config: &WatchdogConfig,
        metrics: Option<&AnalysisMetrics>,
    ) -> Result<SweepReport> {
        let now = Utc::now();
        let expire_cutoff = cutoff(now, config.job_timeout_seconds)?;
        let requeue_cutoff = cutoff(now, config.requeue_after_seconds)?;

        let message = format!(
            "job exceeded {}s without completing",
            config.job_timeout_seconds
        );
        let expired = stores.jobs.expire_running(expire_cutoff, &message).await?;
        for job_id in &expired {
            warn!(%job_id, "Expired stuck analysis job");
        }

        let requeued = stores.jobs.queued_before(requeue_cutoff).await?;
        for job_id in &requeued {
            stores.queue.enqueue(*job_id).await?;
            debug!(%job_id, "Re-dispatched queued analysis job");
        }

        if let Some(metrics) = metrics {
            metrics.jobs_expired_total.inc_by(expired.len() as u64);
            metrics.jobs_requeued_total.inc_by(requeued.len() as u64);
        }

        if !expired.is_empty() || !requeued.is_empty() {
            info!(
                expired = expired.len(),
                requeued = requeued.len(),
                "Watchdog sweep finished"
            );
        }

        Ok(SweepReport { expired, requeued })
    }

    /// Schedule `sweep` on the configured cron expression.
    #[instrument(skip(self), fields(cron = %self.config.cron_expression))]
    pub async fn start(&mut self) -> anyhow::Result<()> {
        if !self.config.enabled {
            info!("Job watchdog is disabled in configuration, not starting");
            return Ok(());
        }
        if self.scheduler.is_some() {
            return Err(anyhow::anyhow!("Job watchdog is already running"));
        }

        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize job scheduler: {}", e))?;

        let stores = self.stores.clone();
        let config = self.config.clone();
        let metrics = self.metrics.clone();
        let sweeping = self.sweeping.clone();

        let job = Job::new_async(self.config.cron_expression.as_str(), move |_uuid, _l| {
            let stores = stores.clone();
            let config = config.clone();
            let metrics = metrics.clone();
            let sweeping = sweeping.clone();

            Box::pin(async move {
                // Skip this tick if the previous sweep is still running
                let Ok(_guard) = sweeping.try_lock() else {
                    warn!("Previous watchdog sweep still running, skipping");
                    return;
                };

                if let Err(e) = Self::sweep_with(&stores, &config, metrics.as_deref()).await {
                    error!("Watchdog sweep failed: {}", e);
                }
            })
        })
        .map_err(|e| anyhow::anyhow!("Failed to create cron job: {}", e))?;

        let job_uuid = scheduler
            .add(job)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to add job to scheduler: {}", e))?;
        scheduler
            .start()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start job scheduler: {}", e))?;

        info!(job_id = %job_uuid, "Job watchdog started");
        self.scheduler = Some(scheduler);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> anyhow::Result<()> {
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler
                .shutdown()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to shutdown job scheduler: {}", e))?;
            // Let an in-progress sweep finish
            let _guard = self.sweeping.lock().await;
            info!("Job watchdog stopped");
        }
        Ok(())
    }
}

fn cutoff(now: DateTime<Utc>, seconds: u64) -> Result<DateTime<Utc>> {
    if seconds > MAX_THRESHOLD_SECONDS {
        return Err(AnalysisError::Configuration(format!(
            "watchdog threshold {seconds}s exceeds {MAX_THRESHOLD_SECONDS}s"
        )));
    }
    let age = Duration::from_std(std::time::Duration::from_secs(seconds))
        .map_err(|e| AnalysisError::Configuration(e.to_string()))?;
    now.checked_sub_signed(age).ok_or_else(|| {
        AnalysisError::Configuration(format!("watchdog threshold {seconds}s is out of range"))
    })
}
