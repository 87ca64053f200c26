use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub queue: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
    pub depth: Option<u64>,
}

/// GET /health: queue connectivity and backlog.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = std::time::Instant::now();

    let queue_check = match state.broker.health_check().await {
        Ok(_) => {
            let latency_ms = Some(start.elapsed().as_millis() as u64);
            let depth = state.broker.queue_depth().await.ok();
            if let Some(depth) = depth {
                metrics::gauge!("job_queue_depth").set(depth as f64);
            }
            ComponentHealth {
                status: "ok".to_string(),
                latency_ms,
                depth,
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Queue health check failed");
            ComponentHealth {
                status: "error".to_string(),
                latency_ms: None,
                depth: None,
            }
        }
    };

    let healthy = queue_check.status == "ok";
    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if healthy { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks { queue: queue_check },
    };

    (status_code, Json(response))
}
