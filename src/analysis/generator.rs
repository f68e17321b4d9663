use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("Generation timed out after {seconds}s")]
    Timeout { seconds: u64 },
    #[error("Generation provider error: {0}")]
    Provider(String),
    #[error("Malformed provider response: {0}")]
    MalformedResponse(String),
    #[error("Generator configuration error: {0}")]
    Configuration(String),
}

/// Turns a conversation transcript into analysis text.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn summarize(&self, transcript: &str) -> Result<String, GeneratorError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Base URL of an Ollama-compatible service
    pub base_url: String,
    /// Model used for analyses
    pub model: String,
    /// Request timeout in seconds (analyses routinely take over a minute)
    pub timeout_seconds: u64,
    pub temperature: f32,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.1:8b".to_string(),
            timeout_seconds: 120,
            temperature: 0.3,
        }
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
    done: bool,
}

#[derive(Clone, Debug)]
pub struct OllamaGenerator {
    config: GeneratorConfig,
    base_url: Url,
    client: Client,
}

impl OllamaGenerator {
    pub fn new(config: GeneratorConfig) -> Result<Self, GeneratorError> {
        let base_url = Self::validate_url(&config.base_url)?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| GeneratorError::Configuration(e.to_string()))?;

        Ok(Self {
            config,
            base_url,
            client,
        })
    }

    fn validate_url(url_str: &str) -> Result<Url, GeneratorError> {
        let url = Url::parse(url_str).map_err(|e| {
            GeneratorError::Configuration(format!("Failed to parse URL '{url_str}': {e}"))
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(GeneratorError::Configuration(format!(
                "Unsupported URL scheme '{}'",
                url.scheme()
            )));
        }
        if url.host_str().is_none() {
            return Err(GeneratorError::Configuration(
                "URL must contain a host".to_string(),
            ));
        }

        Ok(url)
    }

    fn endpoint(&self, path: &str) -> Result<Url, GeneratorError> {
        self.base_url
            .join(path)
            .map_err(|e| GeneratorError::Configuration(e.to_string()))
    }

    fn build_prompt(transcript: &str) -> String {
        format!(
            r#"You are assisting a teacher who wants to understand how their students are using an AI tutor.

Read the conversation transcript below and write a concise analysis covering:
- the main topics and questions students raised
- recurring misconceptions or points of confusion
- signs of engagement or disengagement
- concrete suggestions the teacher could act on

Write plain prose with short headed sections. Do not quote students at length.

Transcript:
{transcript}"#
        )
    }

    fn map_request_error(&self, err: reqwest::Error) -> GeneratorError {
        if err.is_timeout() {
            GeneratorError::Timeout {
                seconds: self.config.timeout_seconds,
            }
        } else {
            GeneratorError::Provider(err.to_string())
        }
    }

    pub async fn health_check(&self) -> bool {
        let url = match self.endpoint("/api/tags") {
            Ok(url) => url,
            Err(_) => return false,
        };

        match self
            .client
            .get(url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                debug!("Generator health check passed");
                true
            }
            Ok(response) => {
                warn!("Generator health check failed: HTTP {}", response.status());
                false
            }
            Err(e) => {
                warn!("Generator health check failed: {}", e);
                false
            }
        }
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    async fn summarize(&self, transcript: &str) -> Result<String, GeneratorError> {
        let url = self.endpoint("/api/generate")?;
        let request = GenerateRequest {
            model: &self.config.model,
            prompt: Self::build_prompt(transcript),
            stream: false,
            options: GenerateOptions {
                temperature: self.config.temperature,
            },
        };

        info!(
            "Requesting analysis from model {} ({} transcript chars)",
            self.config.model,
            transcript.len()
        );

        let response = self
            .client
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_request_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GeneratorError::Provider(format!("HTTP {status}: {body}")));
        }

        let body: GenerateResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                GeneratorError::Timeout {
                    seconds: self.config.timeout_seconds,
                }
            } else {
                GeneratorError::MalformedResponse(e.to_string())
            }
        })?;

        if !body.done {
            return Err(GeneratorError::MalformedResponse(
                "Received incomplete response".to_string(),
            ));
        }

        let text = body.response.trim();
        if text.is_empty() {
            return Err(GeneratorError::MalformedResponse(
                "Provider returned an empty analysis".to_string(),
            ));
        }

        Ok(text.to_string())
    }
}
