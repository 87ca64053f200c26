use std::sync::Arc;

use crate::models::generation::{GenerateRequest, ValidationError};
use crate::models::job::JobId;
use crate::services::broker::{BrokerError, JobBroker, JobRecord};

/// Accepts generation requests and hands them to the broker.
pub struct Dispatcher {
    broker: Arc<dyn JobBroker>,
}

impl Dispatcher {
    pub fn new(broker: Arc<dyn JobBroker>) -> Self {
        Self { broker }
    }

    /// Validate, record and enqueue a job. Returns as soon as the broker has
    /// accepted it; never waits for generation.
    pub async fn submit(&self, request: GenerateRequest) -> Result<JobId, DispatchError> {
        let input = request.into_input()?;
        let record = JobRecord::waiting(JobId::generate(), input);

        self.broker.create(&record).await?;

        metrics::counter!("jobs_submitted_total").increment(1);
        tracing::info!(
            job_id = %record.id,
            inline_image = record.input.primary_image.is_inline(),
            has_person_image = record.input.secondary_image.is_some(),
            "Generation job queued"
        );

        Ok(record.id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Failed to enqueue job: {0}")]
    Broker(#[from] BrokerError),
}
