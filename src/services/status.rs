use std::sync::Arc;

use crate::models::job::{JobId, JobSnapshot, JobState, JobStatus};
use crate::services::broker::{BrokerError, BrokerState, JobBroker, JobRecord};

const DEFAULT_FAILURE_REASON: &str = "Job failed";

/// Collapse a broker state into the public taxonomy.
///
/// Anything the broker reports that is not running or finished reads as
/// queued.
pub fn public_state(state: &BrokerState) -> JobState {
    match state {
        BrokerState::Waiting | BrokerState::Delayed => JobState::Queued,
        BrokerState::Active => JobState::Active,
        BrokerState::Completed => JobState::Completed,
        BrokerState::Failed => JobState::Failed,
        BrokerState::Unknown(_) => JobState::Queued,
    }
}

/// Build the client-facing snapshot of a record.
pub fn snapshot(record: &JobRecord) -> Result<JobSnapshot, BrokerError> {
    let status = match public_state(&record.state) {
        JobState::Queued => JobStatus::Queued,
        JobState::Active => JobStatus::Processing,
        JobState::Completed => match record.result.as_deref() {
            Some(url) if !url.is_empty() => JobStatus::Completed {
                result: url.to_string(),
            },
            _ => {
                return Err(BrokerError::Corrupt {
                    id: record.id.clone(),
                    reason: "completed without a result".to_string(),
                })
            }
        },
        JobState::Failed => JobStatus::Failed {
            error: record
                .failed_reason
                .clone()
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| DEFAULT_FAILURE_REASON.to_string()),
        },
    };

    Ok(JobSnapshot {
        id: record.id.clone(),
        status,
        attempts: record.attempts,
        updated_at: record.updated_at,
    })
}

/// Read-only view of job state.
pub struct StatusService {
    broker: Arc<dyn JobBroker>,
}

impl StatusService {
    pub fn new(broker: Arc<dyn JobBroker>) -> Self {
        Self { broker }
    }

    pub async fn get_status(&self, id: &JobId) -> Result<JobSnapshot, StatusError> {
        let record = self
            .broker
            .fetch(id)
            .await?
            .ok_or_else(|| StatusError::NotFound(id.clone()))?;

        let snapshot = snapshot(&record)?;
        tracing::debug!(
            job_id = %id,
            broker_state = record.state.as_str(),
            status = %snapshot.status.state(),
            "Job status read"
        );
        Ok(snapshot)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("Job {0} not found")]
    NotFound(JobId),

    #[error("Failed to read job status: {0}")]
    Broker(#[from] BrokerError),
}
