//! Request coordinator: decides, per analysis request, whether to answer from
//! the cache, report an in-flight job, or create and enqueue a new job.
//!
//! # Flow
//! 1. Load the scope's messages and fingerprint them
//! 2. Fresh cache record and no forced refresh: answer `ready`
//! 3. A job already queued or running: report it, with the last known analysis
//! 4. Otherwise create a queued job, enqueue it and answer `queued`
//!
//! The coordinator never waits on the generator. Stale-while-revalidate holds
//! throughout: any cached analysis is returned alongside job states.

use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::conversations::ConversationStore;
use super::error::{AnalysisError, Result};
use super::hashing::content_hash;
use super::metrics::AnalysisMetrics;
use super::models::{AnalysisResponse, AnalysisScope, JobCreation, JobStatus, JobStatusResponse};
use super::storage::AnalysisStores;

pub struct RequestCoordinator {
    conversations: Arc<dyn ConversationStore>,
    stores: AnalysisStores,
    metrics: Option<Arc<AnalysisMetrics>>,
}

impl RequestCoordinator {
    pub fn new(conversations: Arc<dyn ConversationStore>, stores: AnalysisStores) -> Self {
        Self {
            conversations,
            stores,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<AnalysisMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn stores(&self) -> &AnalysisStores {
        &self.stores
    }

    #[instrument(skip(self), fields(scope = %scope))]
    pub async fn request_analysis(
        &self,
        scope: &AnalysisScope,
        force_refresh: bool,
    ) -> Result<AnalysisResponse> {
        scope.validate()?;
        if let Some(metrics) = &self.metrics {
            metrics.requests_total.inc();
        }

        let messages = self.conversations.get_messages(scope).await.map_err(|e| {
            warn!("Conversation data unavailable for {}: {}", scope, e);
            AnalysisError::from(e)
        })?;

        if messages.is_empty() {
            debug!("No conversations for {}, nothing to analyze", scope);
            return Ok(AnalysisResponse::empty());
        }

        let current_hash = content_hash(&messages);
        let record = self.stores.cache.get(scope).await?;

        if !force_refresh {
            if let Some(record) = record.as_ref().filter(|r| r.is_fresh_for(&current_hash)) {
                debug!("Serving cached analysis for {}", scope);
                if let Some(metrics) = &self.metrics {
                    metrics.cache_hits_total.inc();
                }
                return Ok(AnalysisResponse::from_cache(record));
            }
        }

        if let Some(job) = self.stores.jobs.find_in_flight(scope).await? {
            debug!("Job {} already {} for {}", job.job_id, job.status, scope);
            return Ok(AnalysisResponse::for_job(&job, record.as_ref()));
        }

        match self.stores.jobs.create_queued(scope).await? {
            JobCreation::Created(job) => {
                self.stores.queue.enqueue(job.job_id).await?;
                if let Some(metrics) = &self.metrics {
                    metrics.jobs_enqueued_total.inc();
                }
                info!(
                    job_id = %job.job_id,
                    force_refresh,
                    "Enqueued analysis job for {}", scope
                );
                Ok(AnalysisResponse::for_job(&job, record.as_ref()))
            }
            JobCreation::AlreadyInFlight(job) => {
                debug!(
                    "Concurrent request created job {} for {} first",
                    job.job_id, scope
                );
                Ok(AnalysisResponse::for_job(&job, record.as_ref()))
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn get_job_status(&self, job_id: Uuid) -> Result<JobStatusResponse> {
        let job = self
            .stores
            .jobs
            .get(job_id)
            .await?
            .ok_or(AnalysisError::NotFound { job_id })?;

        Ok(match job.status {
            JobStatus::Queued => JobStatusResponse::Queued,
            JobStatus::Running => JobStatusResponse::Running,
            JobStatus::Completed => {
                let record = self.stores.cache.get(&job.scope).await?;
                JobStatusResponse::Completed {
                    analysis: record.as_ref().and_then(|r| r.analysis_text.clone()),
                    computed_at: record.and_then(|r| r.computed_at),
                }
            }
            JobStatus::Failed => JobStatusResponse::Failed {
                error_message: job
                    .error_message
                    .unwrap_or_else(|| "analysis failed".to_string()),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::conversations::ConversationError;
    use crate::analysis::models::ConversationMessage;
    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::RwLock;

    #[derive(Default)]
    struct StaticConversations {
        messages: RwLock<Vec<ConversationMessage>>,
        unreachable: RwLock<bool>,
    }

    #[async_trait]
    impl ConversationStore for StaticConversations {
        async fn get_messages(
            &self,
            _scope: &AnalysisScope,
        ) -> std::result::Result<Vec<ConversationMessage>, ConversationError> {
            if *self.unreachable.read().await {
                return Err(ConversationError::Unavailable("connection refused".into()));
            }
            Ok(self.messages.read().await.clone())
        }
    }

    fn message(id: &str, content: &str) -> ConversationMessage {
        ConversationMessage {
            id: id.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
            is_user: true,
        }
    }

    fn coordinator(conversations: Arc<StaticConversations>) -> RequestCoordinator {
        RequestCoordinator::new(conversations, AnalysisStores::in_memory())
    }

    #[tokio::test]
    async fn test_empty_scope_is_ready_without_job() {
        let coordinator = coordinator(Arc::new(StaticConversations::default()));
        let scope = AnalysisScope::student("s-1");

        let response = coordinator.request_analysis(&scope, false).await.unwrap();

        assert_eq!(response, AnalysisResponse::empty());
        assert!(coordinator
            .stores()
            .jobs
            .find_in_flight(&scope)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_second_request_reuses_in_flight_job() {
        let conversations = Arc::new(StaticConversations::default());
        conversations.messages.write().await.push(message("m1", "hi"));
        let coordinator = coordinator(conversations);
        let scope = AnalysisScope::student("s-1");

        let first = coordinator.request_analysis(&scope, false).await.unwrap();
        let second = coordinator.request_analysis(&scope, true).await.unwrap();

        assert!(matches!(first, AnalysisResponse::Queued { .. }));
        assert_eq!(first.job_id(), second.job_id());
    }

    #[tokio::test]
    async fn test_fresh_cache_is_served_and_stale_cache_revalidates() {
        let conversations = Arc::new(StaticConversations::default());
        conversations.messages.write().await.push(message("m1", "hi"));
        let coordinator = coordinator(conversations.clone());
        let scope = AnalysisScope::class("north-high", "9", "B");

        let hash = content_hash(&conversations.messages.read().await);
        let computed_at = Utc::now();
        let stores = coordinator.stores();
        let job_id = stores.jobs.create_queued(&scope).await.unwrap().job().job_id;
        stores
            .jobs
            .transition(job_id, JobStatus::Queued, JobStatus::Running, None)
            .await
            .unwrap();
        stores
            .cache
            .record_success(job_id, &scope, "cached summary", &hash, computed_at)
            .await
            .unwrap();

        let response = coordinator.request_analysis(&scope, false).await.unwrap();
        assert_eq!(
            response,
            AnalysisResponse::Ready {
                analysis: Some("cached summary".to_string()),
                computed_at: Some(computed_at),
            }
        );

        conversations.messages.write().await.push(message("m2", "new"));
        let response = coordinator.request_analysis(&scope, false).await.unwrap();
        assert!(matches!(response, AnalysisResponse::Queued { .. }));
        assert_eq!(response.analysis(), Some("cached summary"));
        assert_eq!(response.computed_at(), Some(computed_at));
    }

    #[tokio::test]
    async fn test_unreachable_conversations_create_nothing() {
        let conversations = Arc::new(StaticConversations::default());
        *conversations.unreachable.write().await = true;
        let coordinator = coordinator(conversations);
        let scope = AnalysisScope::student("s-1");

        let err = coordinator.request_analysis(&scope, true).await.unwrap_err();

        assert!(matches!(err, AnalysisError::Computation { .. }));
        assert!(coordinator.stores().queue.dequeue().await.unwrap().is_none());
        assert!(coordinator.stores().cache.get(&scope).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_blank_scope_is_rejected() {
        let coordinator = coordinator(Arc::new(StaticConversations::default()));
        let err = coordinator
            .request_analysis(&AnalysisScope::student("  "), false)
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidScope(_)));
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let coordinator = coordinator(Arc::new(StaticConversations::default()));
        let job_id = Uuid::new_v4();

        let err = coordinator.get_job_status(job_id).await.unwrap_err();
        assert!(matches!(err, AnalysisError::NotFound { job_id: id } if id == job_id));
    }
}
