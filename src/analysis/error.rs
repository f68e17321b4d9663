use thiserror::Error;
use uuid::Uuid;

use super::conversations::ConversationError;
use super::models::JobStatus;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Conversation data unavailable: {message}")]
    Computation { message: String },

    #[error("Job not found: {job_id}")]
    NotFound { job_id: Uuid },

    #[error("Invalid scope: {0}")]
    InvalidScope(String),

    #[error("Invalid job transition for {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<ConversationError> for AnalysisError {
    fn from(err: ConversationError) -> Self {
        AnalysisError::Computation {
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
