use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::analysis::AnalysisError;

/// JSON body of every error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

pub const NOT_FOUND: &str = "not_found";
pub const INVALID_SCOPE: &str = "invalid_scope";
pub const COMPUTATION_ERROR: &str = "computation_error";
pub const INTERNAL_ERROR: &str = "internal_error";

pub struct ApiError(pub AnalysisError);

impl From<AnalysisError> for ApiError {
    fn from(err: AnalysisError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            AnalysisError::NotFound { .. } => (StatusCode::NOT_FOUND, NOT_FOUND),
            AnalysisError::InvalidScope(_) => (StatusCode::BAD_REQUEST, INVALID_SCOPE),
            AnalysisError::Computation { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, COMPUTATION_ERROR)
            }
            other => {
                error!("Analysis request failed: {}", other);
                (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR)
            }
        };

        let body = ErrorBody {
            error: code.to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
