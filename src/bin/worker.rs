use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use tryon_jobs::{
    config::AppConfig,
    services::{generator::HttpGenerator, queue::JobQueue, worker::Worker},
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting image generation worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    tracing::info!(queue = %config.queue_name, "Connecting to Redis job queue");
    let queue = JobQueue::new(&config.redis_url, &config.queue_name)
        .expect("Failed to initialize job queue");

    let generator_url = config
        .generator_url
        .as_deref()
        .expect("GENERATOR_URL must be set for the worker");
    let generator = HttpGenerator::new(generator_url, config.generator_api_token.clone())
        .expect("Failed to initialize generator client");

    let worker = Worker::new(
        Arc::new(queue),
        Arc::new(generator),
        Duration::from_millis(config.worker_poll_interval_ms),
    )
    .with_lease(Duration::from_secs(config.worker_lease_secs));

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                return;
            }
            tracing::info!("Shutdown signal received, finishing current job");
            cancel.cancel();
        }
    });

    worker.run(cancel).await;
}
