//! Client-side request/poll state machine.
//!
//! ```text
//! Idle -> load -> Ready
//!              -> Queued -> Running -> Ready | Failed
//! Ready  -> refresh -> Queued ...
//! Failed -> retry   -> Queued ...
//! ```
//!
//! Every state change is published on a `watch` channel. Queued, running
//! and failed states keep carrying the last known analysis so a caller never
//! has to blank its view while a refresh runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::retry::{RetryConfig, RetryPolicy};
use super::transport::{AnalysisApi, ClientError};
use crate::analysis::{AnalysisResponse, AnalysisScope, JobStatusResponse};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    pub poll_interval: Duration,
    /// Extra attempts for an initial request lost in transport
    pub request_retries: u32,
    pub retry_delay: Duration,
    /// Transport or not-found poll errors tolerated in a row
    pub max_consecutive_poll_errors: u32,
    /// Operational cap on one polling session; `None` polls until terminal
    pub max_poll_duration: Option<Duration>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(4),
            request_retries: 2,
            retry_delay: Duration::from_secs(1),
            max_consecutive_poll_errors: 3,
            max_poll_duration: Some(Duration::from_secs(600)),
        }
    }
}

/// What the caller should currently display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum AnalysisState {
    Idle,
    Ready {
        analysis: Option<String>,
        computed_at: Option<DateTime<Utc>>,
    },
    Queued {
        job_id: Uuid,
        analysis: Option<String>,
        computed_at: Option<DateTime<Utc>>,
    },
    Running {
        job_id: Uuid,
        analysis: Option<String>,
        computed_at: Option<DateTime<Utc>>,
    },
    Failed {
        job_id: Uuid,
        error_message: String,
        analysis: Option<String>,
        computed_at: Option<DateTime<Utc>>,
    },
}

impl From<AnalysisResponse> for AnalysisState {
    fn from(response: AnalysisResponse) -> Self {
        match response {
            AnalysisResponse::Ready {
                analysis,
                computed_at,
            } => AnalysisState::Ready {
                analysis,
                computed_at,
            },
            AnalysisResponse::Queued {
                job_id,
                analysis,
                computed_at,
            } => AnalysisState::Queued {
                job_id,
                analysis,
                computed_at,
            },
            AnalysisResponse::Running {
                job_id,
                analysis,
                computed_at,
            } => AnalysisState::Running {
                job_id,
                analysis,
                computed_at,
            },
            AnalysisResponse::Failed {
                job_id,
                error_message,
                analysis,
                computed_at,
            } => AnalysisState::Failed {
                job_id,
                error_message,
                analysis,
                computed_at,
            },
        }
    }
}

impl AnalysisState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AnalysisState::Ready { .. } | AnalysisState::Failed { .. })
    }

    pub fn analysis(&self) -> Option<&str> {
        match self {
            AnalysisState::Idle => None,
            AnalysisState::Ready { analysis, .. }
            | AnalysisState::Queued { analysis, .. }
            | AnalysisState::Running { analysis, .. }
            | AnalysisState::Failed { analysis, .. } => analysis.as_deref(),
        }
    }

    pub fn computed_at(&self) -> Option<DateTime<Utc>> {
        match self {
            AnalysisState::Idle => None,
            AnalysisState::Ready { computed_at, .. }
            | AnalysisState::Queued { computed_at, .. }
            | AnalysisState::Running { computed_at, .. }
            | AnalysisState::Failed { computed_at, .. } => *computed_at,
        }
    }
}

struct CancelState {
    cancelled: Mutex<bool>,
    notify: Notify,
}

/// Stops a [`PollingClient`]. Once `cancel` returns no further state is
/// published and every pending or later call resolves to
/// [`ClientError::Cancelled`].
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<CancelState>,
}

impl CancelHandle {
    fn new() -> Self {
        Self {
            inner: Arc::new(CancelState {
                cancelled: Mutex::new(false),
                notify: Notify::new(),
            }),
        }
    }

    fn flag(&self) -> MutexGuard<'_, bool> {
        self.inner
            .cancelled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn cancel(&self) {
        *self.flag() = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.flag()
    }

    async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

pub struct PollingClient {
    api: Arc<dyn AnalysisApi>,
    config: PollingConfig,
    retry: RetryPolicy,
    state: watch::Sender<AnalysisState>,
    cancel: CancelHandle,
}

impl PollingClient {
    pub fn new(api: Arc<dyn AnalysisApi>, config: PollingConfig) -> Self {
        let retry = RetryPolicy::new(RetryConfig::fixed(
            config.request_retries,
            config.retry_delay,
        ));
        let (state, _) = watch::channel(AnalysisState::Idle);

        Self {
            api,
            config,
            retry,
            state,
            cancel: CancelHandle::new(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<AnalysisState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> AnalysisState {
        self.state.borrow().clone()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Show the analysis for `scope`, computing it if the cache is stale.
    pub async fn load(&self, scope: &AnalysisScope) -> Result<AnalysisState, ClientError> {
        self.run(scope, false).await
    }

    /// Recompute even though the cached analysis is current.
    pub async fn refresh(&self, scope: &AnalysisScope) -> Result<AnalysisState, ClientError> {
        self.run(scope, true).await
    }

    /// Manual retry after a failed job.
    pub async fn retry(&self, scope: &AnalysisScope) -> Result<AnalysisState, ClientError> {
        self.run(scope, true).await
    }

    async fn run(
        &self,
        scope: &AnalysisScope,
        force_refresh: bool,
    ) -> Result<AnalysisState, ClientError> {
        if self.cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }

        let response = self.request(scope, force_refresh).await?;
        let state = AnalysisState::from(response);
        self.publish(state.clone())?;

        match &state {
            AnalysisState::Queued {
                job_id,
                analysis,
                computed_at,
            }
            | AnalysisState::Running {
                job_id,
                analysis,
                computed_at,
            } => {
                self.poll(*job_id, analysis.clone(), *computed_at)
                    .await
            }
            _ => Ok(state),
        }
    }

    /// Initial request with bounded retry of transport failures. The request
    /// may have been accepted even though the response was lost, so retries
    /// never force a refresh; they pick up the job the first attempt created.
    async fn request(
        &self,
        scope: &AnalysisScope,
        force_refresh: bool,
    ) -> Result<AnalysisResponse, ClientError> {
        let mut first_attempt = true;
        let attempts = self.retry.execute_if(
            || {
                let force = force_refresh && std::mem::replace(&mut first_attempt, false);
                self.api.request_analysis(scope, force)
            },
            ClientError::is_transport,
        );
        self.guarded(attempts).await
    }

    async fn poll(
        &self,
        job_id: Uuid,
        analysis: Option<String>,
        computed_at: Option<DateTime<Utc>>,
    ) -> Result<AnalysisState, ClientError> {
        let started = Instant::now();
        let mut consecutive_errors = 0;

        loop {
            self.guarded(async {
                tokio::time::sleep(self.config.poll_interval).await;
                Ok(())
            })
            .await?;

            if let Some(limit) = self.config.max_poll_duration {
                let waited = started.elapsed();
                if waited >= limit {
                    warn!(%job_id, "Stopped polling after {:?}", waited);
                    return Err(ClientError::PollTimeout { job_id, waited });
                }
            }

            let status = match self.guarded(self.api.get_job_status(job_id)).await {
                Ok(status) => {
                    consecutive_errors = 0;
                    status
                }
                Err(e @ (ClientError::Transport(_) | ClientError::NotFound(_))) => {
                    consecutive_errors += 1;
                    if consecutive_errors > self.config.max_consecutive_poll_errors {
                        return Err(e);
                    }
                    debug!(%job_id, "Poll failed ({} in a row): {}", consecutive_errors, e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let state = match status {
                JobStatusResponse::Queued => AnalysisState::Queued {
                    job_id,
                    analysis: analysis.clone(),
                    computed_at,
                },
                JobStatusResponse::Running => AnalysisState::Running {
                    job_id,
                    analysis: analysis.clone(),
                    computed_at,
                },
                JobStatusResponse::Completed {
                    analysis,
                    computed_at,
                } => AnalysisState::Ready {
                    analysis,
                    computed_at,
                },
                JobStatusResponse::Failed { error_message } => {
                    info!(%job_id, "Analysis job failed: {}", error_message);
                    AnalysisState::Failed {
                        job_id,
                        error_message,
                        analysis: analysis.clone(),
                        computed_at,
                    }
                }
            };

            self.publish(state.clone())?;
            if state.is_terminal() {
                return Ok(state);
            }
        }
    }

    /// Race `fut` against cancellation.
    async fn guarded<T>(
        &self,
        fut: impl Future<Output = Result<T, ClientError>>,
    ) -> Result<T, ClientError> {
        tokio::select! {
            result = fut => result,
            _ = self.cancel.cancelled() => Err(ClientError::Cancelled),
        }
    }

    fn publish(&self, state: AnalysisState) -> Result<(), ClientError> {
        // Held while sending so a concurrent cancel cannot slip in between.
        let cancelled = self.cancel.flag();
        if *cancelled {
            return Err(ClientError::Cancelled);
        }
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        Ok(())
    }
}
