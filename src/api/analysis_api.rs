use axum::{
    extract::{Path, State},
    response::Json,
};
use uuid::Uuid;

use super::error::ApiError;
use super::AppState;
use crate::analysis::{AnalysisRequest, AnalysisResponse, JobStatusResponse};

/// `POST /api/analysis`
pub async fn request_analysis(
    State(state): State<AppState>,
    Json(request): Json<AnalysisRequest>,
) -> Result<Json<AnalysisResponse>, ApiError> {
    let response = state
        .coordinator
        .request_analysis(&request.scope, request.force_refresh)
        .await?;
    Ok(Json(response))
}

/// `GET /api/analysis/jobs/:job_id`
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    Ok(Json(state.coordinator.get_job_status(job_id).await?))
}
