use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::services::broker::{BrokerError, JobBroker, Transition, WorkItem};
use crate::services::generator::{GenerationError, Generator};

/// How long a claimed job stays reserved without a renewal.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(60);

const EMPTY_RESULT_REASON: &str = "model returned no image";

/// Pulls work items from the broker, runs generation and records the outcome.
///
/// A claimed item is held under a lease that the worker renews while the
/// generation runs. Items whose lease ran out (their worker died) go back
/// to the queue. Generation failures become failed jobs; nothing is retried
/// automatically.
pub struct Worker {
    broker: Arc<dyn JobBroker>,
    generator: Arc<dyn Generator>,
    poll_interval: Duration,
    lease: Duration,
}

impl Worker {
    pub fn new(
        broker: Arc<dyn JobBroker>,
        generator: Arc<dyn Generator>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            broker,
            generator,
            poll_interval,
            lease: DEFAULT_LEASE,
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Process jobs until `cancel` fires. A job already running when the
    /// token fires is finished first.
    pub async fn run(&self, cancel: CancellationToken) {
        self.reclaim_expired().await;

        tracing::info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            lease_ms = self.lease.as_millis() as u64,
            "Worker ready, starting job processing loop"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let idle = match self.process_next_job().await {
                Ok(true) => {
                    tracing::debug!("Job processed, checking for next job");
                    false
                }
                Ok(false) => {
                    tracing::trace!("No jobs available, sleeping");
                    self.reclaim_expired().await;
                    if let Ok(depth) = self.broker.queue_depth().await {
                        metrics::gauge!("job_queue_depth").set(depth as f64);
                    }
                    true
                }
                Err(e) => {
                    tracing::error!(error = %e, "Error processing job, will retry");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }

        tracing::info!("Worker shutting down");
    }

    async fn reclaim_expired(&self) {
        match self.broker.requeue_expired().await {
            Ok(0) => {}
            Ok(moved) => tracing::warn!(moved, "Requeued jobs whose worker stopped renewing"),
            Err(e) => tracing::error!(error = %e, "Failed to requeue expired jobs"),
        }
    }

    /// Process the next job from the queue.
    /// Returns Ok(true) if a job was processed, Ok(false) if no job available.
    pub async fn process_next_job(&self) -> Result<bool, BrokerError> {
        let Some(item) = self.broker.dequeue(self.lease).await? else {
            return Ok(false);
        };

        match self.broker.mark_active(&item.job_id).await? {
            Transition::Applied => {}
            Transition::AlreadyTerminal => {
                // Redelivered after another worker finished it; just ack.
                tracing::warn!(job_id = %item.job_id, "Skipping redelivered job that is already finished");
                self.broker.ack(&item.job_id).await?;
                return Ok(true);
            }
            Transition::Missing => {
                tracing::warn!(job_id = %item.job_id, "Job record disappeared before processing");
                self.broker.ack(&item.job_id).await?;
                return Ok(true);
            }
        }

        self.run_job(&item).await?;
        Ok(true)
    }

    async fn run_job(&self, item: &WorkItem) -> Result<(), BrokerError> {
        tracing::info!(
            job_id = %item.job_id,
            inline_image = item.input.primary_image.is_inline(),
            "Processing generation job"
        );

        let start = Instant::now();
        let outcome = self.generate_holding_lease(item).await;
        let elapsed = start.elapsed();
        metrics::histogram!("generation_duration_seconds").record(elapsed.as_secs_f64());

        let outcome = match outcome {
            Ok(url) if url.trim().is_empty() => Err(EMPTY_RESULT_REASON.to_string()),
            Ok(url) => Ok(url),
            Err(e) => Err(e.to_string()),
        };

        let (transition, succeeded) = match outcome {
            Ok(artifact_url) => {
                let transition = self.broker.complete(&item.job_id, &artifact_url).await?;
                tracing::info!(
                    job_id = %item.job_id,
                    duration_ms = elapsed.as_millis() as u64,
                    artifact_url = %artifact_url,
                    "Job completed successfully"
                );
                (transition, true)
            }
            Err(reason) => {
                let transition = self.broker.fail(&item.job_id, &reason).await?;
                tracing::warn!(
                    job_id = %item.job_id,
                    duration_ms = elapsed.as_millis() as u64,
                    error = %reason,
                    "Job generation failed"
                );
                (transition, false)
            }
        };

        match transition {
            Transition::Applied if succeeded => metrics::counter!("jobs_completed_total").increment(1),
            Transition::Applied => metrics::counter!("jobs_failed_total").increment(1),
            other => tracing::warn!(
                job_id = %item.job_id,
                transition = ?other,
                "Terminal write was not applied"
            ),
        }

        Ok(())
    }

    /// Run the generator, renewing the lease every third of its length.
    async fn generate_holding_lease(&self, item: &WorkItem) -> Result<String, GenerationError> {
        let period = (self.lease / 3).max(Duration::from_millis(1));
        let mut renewals = tokio::time::interval_at(Instant::now() + period, period);
        renewals.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let generation = self.generator.generate(&item.input);
        tokio::pin!(generation);

        loop {
            tokio::select! {
                outcome = &mut generation => return outcome,
                _ = renewals.tick() => match self.broker.renew(&item.job_id, self.lease).await {
                    Ok(true) => {}
                    Ok(false) => tracing::warn!(
                        job_id = %item.job_id,
                        "Lease lost while generating; another worker may pick this job up"
                    ),
                    Err(e) => tracing::warn!(job_id = %item.job_id, error = %e, "Failed to renew lease"),
                },
            }
        }
    }
}
