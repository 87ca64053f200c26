use axum::extract::rejection::JsonRejection;
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;
use crate::models::generation::ErrorResponse;
use crate::services::dispatcher::DispatchError;
use crate::services::status::StatusError;

pub mod generate;
pub mod health;
pub mod metrics;
pub mod status;

/// Inline `data:` images make request bodies large.
const MAX_BODY_BYTES: usize = 20 * 1024 * 1024;

/// API routes with the standard middleware stack.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/generate", post(generate::submit_generation))
        .route("/api/status/{job_id}", get(status::get_job_status))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
}

/// Error returned by API handlers, rendered as `{ "error": "..." }`.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(&'static str),
    Internal(&'static str),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message.to_string()),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message.to_string()),
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Validation(e) => ApiError::BadRequest(e.to_string()),
            DispatchError::Broker(e) => {
                tracing::error!(error = %e, "Failed to create job");
                ApiError::Internal("Failed to create job")
            }
        }
    }
}

impl From<StatusError> for ApiError {
    fn from(err: StatusError) -> Self {
        match err {
            StatusError::NotFound(_) => ApiError::NotFound("Job not found"),
            StatusError::Broker(e) => {
                tracing::error!(error = %e, "Failed to get job status");
                ApiError::Internal("Failed to get job status")
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}
