use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use crate::models::job::JobId;
use crate::services::broker::{BrokerError, BrokerState, JobBroker, JobRecord, Transition, WorkItem};

/// Process-local broker with the same guarantees as [`JobQueue`].
///
/// Every operation runs under one lock, which gives atomic create+enqueue
/// and compare-and-set terminal writes. Lease deadlines follow the Tokio
/// clock, so paused-time tests can run them out.
///
/// [`JobQueue`]: crate::services::queue::JobQueue
#[derive(Default)]
pub struct MemoryBroker {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    records: HashMap<JobId, JobRecord>,
    waiting: VecDeque<JobId>,
    /// In-flight ids and their lease deadlines.
    in_flight: HashMap<JobId, Instant>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the stored state of a record. Lets tests simulate broker
    /// states this crate never writes itself, such as `delayed`.
    pub fn force_state(&self, id: &JobId, state: BrokerState) -> bool {
        let mut inner = self.inner.lock();
        match inner.records.get_mut(id) {
            Some(record) => {
                record.state = state;
                record.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    fn finish(&self, id: &JobId, apply: impl FnOnce(&mut JobRecord)) -> Transition {
        let mut inner = self.inner.lock();
        inner.in_flight.remove(id);

        let Some(record) = inner.records.get_mut(id) else {
            return Transition::Missing;
        };
        if record.state.is_terminal() {
            return Transition::AlreadyTerminal;
        }
        apply(record);
        record.updated_at = Utc::now();
        Transition::Applied
    }
}

#[async_trait]
impl JobBroker for MemoryBroker {
    async fn create(&self, record: &JobRecord) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock();
        if inner.records.contains_key(&record.id) {
            return Err(BrokerError::Conflict(record.id.clone()));
        }
        let mut record = record.clone();
        record.state = BrokerState::Waiting;
        inner.waiting.push_back(record.id.clone());
        inner.records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn fetch(&self, id: &JobId) -> Result<Option<JobRecord>, BrokerError> {
        Ok(self.inner.lock().records.get(id).cloned())
    }

    async fn dequeue(&self, lease: Duration) -> Result<Option<WorkItem>, BrokerError> {
        let mut inner = self.inner.lock();
        while let Some(job_id) = inner.waiting.pop_front() {
            let Some(input) = inner.records.get(&job_id).map(|r| r.input.clone()) else {
                continue;
            };
            inner.in_flight.insert(job_id.clone(), Instant::now() + lease);
            return Ok(Some(WorkItem { job_id, input }));
        }
        Ok(None)
    }

    async fn renew(&self, id: &JobId, lease: Duration) -> Result<bool, BrokerError> {
        let mut inner = self.inner.lock();
        match inner.in_flight.get_mut(id) {
            Some(deadline) => {
                *deadline = Instant::now() + lease;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_active(&self, id: &JobId) -> Result<Transition, BrokerError> {
        let mut inner = self.inner.lock();
        let Some(record) = inner.records.get_mut(id) else {
            return Ok(Transition::Missing);
        };
        if record.state.is_terminal() {
            return Ok(Transition::AlreadyTerminal);
        }
        record.state = BrokerState::Active;
        record.attempts += 1;
        record.updated_at = Utc::now();
        Ok(Transition::Applied)
    }

    async fn complete(&self, id: &JobId, artifact_url: &str) -> Result<Transition, BrokerError> {
        Ok(self.finish(id, |record| {
            record.state = BrokerState::Completed;
            record.result = Some(artifact_url.to_string());
        }))
    }

    async fn fail(&self, id: &JobId, reason: &str) -> Result<Transition, BrokerError> {
        Ok(self.finish(id, |record| {
            record.state = BrokerState::Failed;
            record.failed_reason = Some(reason.to_string());
        }))
    }

    async fn ack(&self, id: &JobId) -> Result<(), BrokerError> {
        self.inner.lock().in_flight.remove(id);
        Ok(())
    }

    async fn requeue_expired(&self) -> Result<u64, BrokerError> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let expired: Vec<JobId> = inner
            .in_flight
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            inner.in_flight.remove(id);
            if let Some(record) = inner.records.get_mut(id) {
                if record.state == BrokerState::Active {
                    record.state = BrokerState::Waiting;
                    record.updated_at = Utc::now();
                }
            }
            inner.waiting.push_front(id.clone());
        }
        Ok(expired.len() as u64)
    }

    async fn queue_depth(&self) -> Result<u64, BrokerError> {
        Ok(self.inner.lock().waiting.len() as u64)
    }

    async fn health_check(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}
