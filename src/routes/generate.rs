use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;

use crate::app_state::AppState;
use crate::models::generation::{GenerateRequest, GenerateResponse};
use crate::routes::ApiError;

/// POST /api/generate: Queue an image-generation job.
pub async fn submit_generation(
    State(state): State<AppState>,
    request: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let Json(request) = request?;
    let job_id = state.dispatcher.submit(request).await?;
    Ok(Json(GenerateResponse { job_id }))
}
