use axum::extract::{Path, State};
use axum::Json;

use crate::app_state::AppState;
use crate::models::job::{JobId, JobStatus};
use crate::routes::ApiError;

/// GET /api/status/{job_id}: Current status of a generation job.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatus>, ApiError> {
    let snapshot = state.status.get_status(&JobId::from(job_id)).await?;
    Ok(Json(snapshot.status))
}
