use axum::routing::get;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use tryon_jobs::{app_state::AppState, config::AppConfig, routes, services::queue::JobQueue};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing tryon-jobs server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!("jobs_submitted_total", "Total generation jobs submitted");
    metrics::describe_gauge!("job_queue_depth", "Current number of queued jobs");

    tracing::info!(queue = %config.queue_name, "Connecting to Redis job queue");
    let queue = JobQueue::new(&config.redis_url, &config.queue_name)
        .expect("Failed to initialize job queue");

    let state = AppState::new(Arc::new(queue));

    let app = routes::router(state).route(
        "/metrics",
        get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
    );

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    tracing::info!("Server stopped");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
