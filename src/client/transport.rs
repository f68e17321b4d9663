//! Caller-side access to the analysis service.
//!
//! [`AnalysisApi`] is what the polling client talks to. It is implemented by
//! [`HttpAnalysisClient`] for remote servers and directly by
//! [`RequestCoordinator`] for single-process deployments.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::analysis::{
    AnalysisError, AnalysisRequest, AnalysisResponse, AnalysisScope, JobStatusResponse,
    RequestCoordinator,
};
use crate::api::error::{ErrorBody, COMPUTATION_ERROR};

#[derive(Debug, Error)]
pub enum ClientError {
    /// The request or its response was lost on the way. The server may
    /// still have acted on it.
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Job not found: {0}")]
    NotFound(Uuid),
    #[error("Conversation data unavailable: {0}")]
    Computation(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("Gave up polling job {job_id} after {waited:?}")]
    PollTimeout { job_id: Uuid, waited: Duration },
    #[error("Polling cancelled")]
    Cancelled,
}

impl ClientError {
    pub fn is_transport(&self) -> bool {
        matches!(self, ClientError::Transport(_))
    }
}

impl From<AnalysisError> for ClientError {
    fn from(err: AnalysisError) -> Self {
        match err {
            AnalysisError::NotFound { job_id } => ClientError::NotFound(job_id),
            AnalysisError::Computation { message } => ClientError::Computation(message),
            AnalysisError::InvalidScope(message) => ClientError::InvalidRequest(message),
            other => ClientError::Server {
                status: 500,
                message: other.to_string(),
            },
        }
    }
}

#[async_trait]
pub trait AnalysisApi: Send + Sync {
    async fn request_analysis(
        &self,
        scope: &AnalysisScope,
        force_refresh: bool,
    ) -> Result<AnalysisResponse, ClientError>;

    async fn get_job_status(&self, job_id: Uuid) -> Result<JobStatusResponse, ClientError>;
}

#[async_trait]
impl AnalysisApi for RequestCoordinator {
    async fn request_analysis(
        &self,
        scope: &AnalysisScope,
        force_refresh: bool,
    ) -> Result<AnalysisResponse, ClientError> {
        Ok(RequestCoordinator::request_analysis(self, scope, force_refresh).await?)
    }

    async fn get_job_status(&self, job_id: Uuid) -> Result<JobStatusResponse, ClientError> {
        Ok(RequestCoordinator::get_job_status(self, job_id).await?)
    }
}

#[derive(Clone, Debug)]
pub struct HttpAnalysisClient {
    base_url: Url,
    client: Client,
}

impl HttpAnalysisClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ClientError::InvalidRequest(format!("Invalid server URL: {e}")))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(ClientError::InvalidRequest(format!(
                "Unsupported URL scheme '{}'",
                base_url.scheme()
            )));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;

        Ok(Self { base_url, client })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        self.base_url
            .join(path)
            .map_err(|e| ClientError::InvalidRequest(e.to_string()))
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        job_id: Option<Uuid>,
    ) -> Result<T, ClientError> {
        let status = response.status();
        if status.is_success() {
            return response.json::<T>().await.map_err(|e| {
                if e.is_decode() {
                    ClientError::Server {
                        status: status.as_u16(),
                        message: format!("Malformed response: {e}"),
                    }
                } else {
                    ClientError::Transport(e.to_string())
                }
            });
        }

        // Gateways answer with their own bodies, so only our JSON shape counts.
        let body = response.json::<ErrorBody>().await.ok();
        let message = body
            .as_ref()
            .map(|b| b.message.clone())
            .unwrap_or_else(|| status.to_string());

        Err(match (status, job_id) {
            (StatusCode::BAD_GATEWAY | StatusCode::GATEWAY_TIMEOUT, _) => {
                ClientError::Transport(message)
            }
            (StatusCode::NOT_FOUND, Some(job_id)) if body.is_some() => {
                ClientError::NotFound(job_id)
            }
            (StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY, _) => {
                ClientError::InvalidRequest(message)
            }
            (StatusCode::SERVICE_UNAVAILABLE, _) => match body {
                Some(b) if b.error == COMPUTATION_ERROR => ClientError::Computation(b.message),
                _ => ClientError::Transport(message),
            },
            _ => ClientError::Server {
                status: status.as_u16(),
                message,
            },
        })
    }
}

fn transport(err: reqwest::Error) -> ClientError {
    ClientError::Transport(err.to_string())
}

#[async_trait]
impl AnalysisApi for HttpAnalysisClient {
    async fn request_analysis(
        &self,
        scope: &AnalysisScope,
        force_refresh: bool,
    ) -> Result<AnalysisResponse, ClientError> {
        let url = self.endpoint("/api/analysis")?;
        let body = AnalysisRequest {
            scope: scope.clone(),
            force_refresh,
        };

        debug!("POST {} for {} (force_refresh={})", url, scope, force_refresh);
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        Self::decode(response, None).await
    }

    async fn get_job_status(&self, job_id: Uuid) -> Result<JobStatusResponse, ClientError> {
        let url = self.endpoint(&format!("/api/analysis/jobs/{job_id}"))?;
        let response = self.client.get(url).send().await.map_err(transport)?;
        Self::decode(response, Some(job_id)).await
    }
}
