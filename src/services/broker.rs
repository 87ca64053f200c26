use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use strum::EnumString;

use crate::models::job::{JobId, JobInput};

/// Lifecycle state as recorded by the queue backend.
///
/// This is broker bookkeeping; clients only ever see [`JobStatus`].
///
/// [`JobStatus`]: crate::models::job::JobStatus
#[derive(Debug, Clone, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum BrokerState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
    #[strum(default)]
    Unknown(String),
}

impl BrokerState {
    pub fn as_str(&self) -> &str {
        match self {
            BrokerState::Waiting => "waiting",
            BrokerState::Delayed => "delayed",
            BrokerState::Active => "active",
            BrokerState::Completed => "completed",
            BrokerState::Failed => "failed",
            BrokerState::Unknown(other) => other,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BrokerState::Completed | BrokerState::Failed)
    }

    /// Parse a stored state string. Unrecognized values are kept verbatim.
    pub fn parse(raw: &str) -> Self {
        raw.parse()
            .unwrap_or_else(|_| BrokerState::Unknown(raw.to_string()))
    }
}

/// Durable per-job record held by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub id: JobId,
    pub input: JobInput,
    pub state: BrokerState,
    pub result: Option<String>,
    pub failed_reason: Option<String>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// A freshly submitted job, waiting for a worker.
    pub fn waiting(id: JobId, input: JobInput) -> Self {
        let now = Utc::now();
        Self {
            id,
            input,
            state: BrokerState::Waiting,
            result: None,
            failed_reason: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Unit of work handed to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub job_id: JobId,
    pub input: JobInput,
}

/// Outcome of a conditional state write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The write happened.
    Applied,
    /// The record was already completed or failed; nothing changed.
    AlreadyTerminal,
    /// No record exists for the id.
    Missing,
}

/// Durable FIFO queue plus per-job state storage.
///
/// `create` records the job and enqueues its work item in one atomic step.
/// Terminal writes (`complete`, `fail`) only apply to non-terminal records,
/// so a job is finalized at most once.
#[async_trait]
pub trait JobBroker: Send + Sync {
    /// Create a `waiting` record and enqueue it. Fails with
    /// [`BrokerError::Conflict`] if the id already exists.
    async fn create(&self, record: &JobRecord) -> Result<(), BrokerError>;

    async fn fetch(&self, id: &JobId) -> Result<Option<JobRecord>, BrokerError>;

    /// Take the oldest queued item and hold it in flight for `lease`.
    ///
    /// Until the lease runs out no other worker can reclaim the item; a
    /// worker that is still running it extends the lease with [`renew`].
    ///
    /// [`renew`]: JobBroker::renew
    async fn dequeue(&self, lease: Duration) -> Result<Option<WorkItem>, BrokerError>;

    /// Push the lease of an in-flight item out to `lease` from now. Returns
    /// `false` if the item is no longer held (finished, or reclaimed after
    /// the lease ran out).
    async fn renew(&self, id: &JobId, lease: Duration) -> Result<bool, BrokerError>;

    async fn mark_active(&self, id: &JobId) -> Result<Transition, BrokerError>;

    async fn complete(&self, id: &JobId, artifact_url: &str) -> Result<Transition, BrokerError>;

    async fn fail(&self, id: &JobId, reason: &str) -> Result<Transition, BrokerError>;

    /// Drop an in-flight item without touching its record.
    async fn ack(&self, id: &JobId) -> Result<(), BrokerError>;

    /// Return in-flight items whose lease ran out to the front of the queue.
    /// Items held under a live lease are left alone.
    async fn requeue_expired(&self) -> Result<u64, BrokerError>;

    async fn queue_depth(&self) -> Result<u64, BrokerError>;

    async fn health_check(&self) -> Result<(), BrokerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Job {0} already exists")]
    Conflict(JobId),

    #[error("Corrupt job record {id}: {reason}")]
    Corrupt { id: JobId, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_states() {
        assert_eq!(BrokerState::parse("waiting"), BrokerState::Waiting);
        assert_eq!(BrokerState::parse("delayed"), BrokerState::Delayed);
        assert_eq!(BrokerState::parse("active"), BrokerState::Active);
        assert_eq!(BrokerState::parse("completed"), BrokerState::Completed);
        assert_eq!(BrokerState::parse("failed"), BrokerState::Failed);
    }

    #[test]
    fn test_parse_unknown_state_roundtrips_text() {
        let state = BrokerState::parse("paused");
        assert_eq!(state, BrokerState::Unknown("paused".to_string()));
        assert_eq!(state.as_str(), "paused");
        assert!(!state.is_terminal());
    }
}
