use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;

use crate::models::job::{JobId, JobInput};
use crate::services::broker::{BrokerError, BrokerState, JobBroker, JobRecord, Transition, WorkItem};

/// Records the job hash and pushes its id in one step.
/// KEYS: job hash, wait list. ARGV: id, input json, timestamp.
const CREATE_JOB: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('HSET', KEYS[1],
  'id', ARGV[1], 'input', ARGV[2], 'state', 'waiting', 'attempts', '0',
  'created_at', ARGV[3], 'updated_at', ARGV[3])
redis.call('LPUSH', KEYS[2], ARGV[1])
return 1
"#;

/// KEYS: wait list, lease set. ARGV: lease in ms.
/// Deadlines use the Redis clock so workers on different hosts agree.
const CLAIM_NEXT: &str = r#"
local id = redis.call('RPOP', KEYS[1])
if not id then
  return false
end
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
redis.call('ZADD', KEYS[2], now + tonumber(ARGV[1]), id)
return id
"#;

/// KEYS: lease set. ARGV: id, lease in ms.
const RENEW_LEASE: &str = r#"
if not redis.call('ZSCORE', KEYS[1], ARGV[1]) then
  return 0
end
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
redis.call('ZADD', KEYS[1], now + tonumber(ARGV[2]), ARGV[1])
return 1
"#;

/// KEYS: lease set.
const EXPIRED_LEASES: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
return redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', now)
"#;

/// KEYS: job hash. ARGV: timestamp.
const MARK_ACTIVE: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
if not state then
  return -1
end
if state == 'completed' or state == 'failed' then
  return 0
end
redis.call('HSET', KEYS[1], 'state', 'active', 'updated_at', ARGV[1])
redis.call('HINCRBY', KEYS[1], 'attempts', 1)
return 1
"#;

/// Terminal write guarded on the current state; always drops the lease.
/// KEYS: job hash, lease set. ARGV: id, state, field, value, timestamp.
const FINISH_JOB: &str = r#"
redis.call('ZREM', KEYS[2], ARGV[1])
local state = redis.call('HGET', KEYS[1], 'state')
if not state then
  return -1
end
if state == 'completed' or state == 'failed' then
  return 0
end
redis.call('HSET', KEYS[1], 'state', ARGV[2], ARGV[3], ARGV[4], 'updated_at', ARGV[5])
return 1
"#;

/// Requeues one id if its lease is still expired when the script runs.
/// KEYS: lease set, wait list, job hash. ARGV: id, timestamp.
const REQUEUE_EXPIRED: &str = r#"
local deadline = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not deadline then
  return 0
end
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
if tonumber(deadline) > now then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('RPUSH', KEYS[2], ARGV[1])
if redis.call('HGET', KEYS[3], 'state') == 'active' then
  redis.call('HSET', KEYS[3], 'state', 'waiting', 'updated_at', ARGV[2])
end
return 1
"#;

/// Redis-backed job broker.
///
/// Layout under the queue name `q`:
/// - `{q}:wait` list of queued ids (LPUSH in, RPOP out)
/// - `{q}:leases` sorted set of in-flight ids scored by lease deadline (ms)
/// - `{q}:job:<id>` hash with the job record
///
/// Every key carries the `{q}` hash tag and every script declares the keys
/// it touches, so the scripts run on a single cluster slot.
pub struct JobQueue {
    client: redis::Client,
    wait_key: String,
    lease_key: String,
    job_prefix: String,
    create_job: redis::Script,
    claim_next: redis::Script,
    renew_lease: redis::Script,
    expired_leases: redis::Script,
    mark_active: redis::Script,
    finish_job: redis::Script,
    requeue_expired: redis::Script,
}

impl JobQueue {
    pub fn new(redis_url: &str, queue_name: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url).map_err(BrokerError::Redis)?;
        Ok(Self {
            client,
            wait_key: format!("{{{queue_name}}}:wait"),
            lease_key: format!("{{{queue_name}}}:leases"),
            job_prefix: format!("{{{queue_name}}}:job:"),
            create_job: redis::Script::new(CREATE_JOB),
            claim_next: redis::Script::new(CLAIM_NEXT),
            renew_lease: redis::Script::new(RENEW_LEASE),
            expired_leases: redis::Script::new(EXPIRED_LEASES),
            mark_active: redis::Script::new(MARK_ACTIVE),
            finish_job: redis::Script::new(FINISH_JOB),
            requeue_expired: redis::Script::new(REQUEUE_EXPIRED),
        })
    }

    fn job_key(&self, id: &JobId) -> String {
        format!("{}{}", self.job_prefix, id)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, BrokerError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(BrokerError::Redis)
    }

    async fn finish(
        &self,
        id: &JobId,
        state: BrokerState,
        field: &str,
        value: &str,
    ) -> Result<Transition, BrokerError> {
        let mut conn = self.connection().await?;
        let code: i64 = self
            .finish_job
            .key(self.job_key(id))
            .key(&self.lease_key)
            .arg(id.as_str())
            .arg(state.as_str())
            .arg(field)
            .arg(value)
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await?;
        Ok(transition_from_code(code))
    }
}

#[async_trait]
impl JobBroker for JobQueue {
    async fn create(&self, record: &JobRecord) -> Result<(), BrokerError> {
        let mut conn = self.connection().await?;
        let input = serde_json::to_string(&record.input).map_err(BrokerError::Serialize)?;
        let created: i64 = self
            .create_job
            .key(self.job_key(&record.id))
            .key(&self.wait_key)
            .arg(record.id.as_str())
            .arg(input)
            .arg(record.created_at.to_rfc3339())
            .invoke_async(&mut conn)
            .await?;

        if created == 0 {
            return Err(BrokerError::Conflict(record.id.clone()));
        }
        Ok(())
    }

    async fn fetch(&self, id: &JobId) -> Result<Option<JobRecord>, BrokerError> {
        let mut conn = self.connection().await?;
        let fields: HashMap<String, String> = conn.hgetall(self.job_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        decode_record(id, fields).map(Some)
    }

    async fn dequeue(&self, lease: Duration) -> Result<Option<WorkItem>, BrokerError> {
        let mut conn = self.connection().await?;
        let popped: Option<String> = self
            .claim_next
            .key(&self.wait_key)
            .key(&self.lease_key)
            .arg(lease_millis(lease))
            .invoke_async(&mut conn)
            .await?;

        let Some(raw_id) = popped else {
            return Ok(None);
        };
        let job_id = JobId::from(raw_id);
        let input: Option<String> = conn.hget(self.job_key(&job_id), "input").await?;

        match input {
            Some(input) => Ok(Some(WorkItem {
                input: serde_json::from_str(&input).map_err(BrokerError::Serialize)?,
                job_id,
            })),
            None => {
                // Record expired while queued; drop the orphaned id.
                tracing::warn!(job_id = %job_id, "Dequeued id has no job record, discarding");
                conn.zrem::<_, _, ()>(&self.lease_key, job_id.as_str()).await?;
                Ok(None)
            }
        }
    }

    async fn renew(&self, id: &JobId, lease: Duration) -> Result<bool, BrokerError> {
        let mut conn = self.connection().await?;
        let held: i64 = self
            .renew_lease
            .key(&self.lease_key)
            .arg(id.as_str())
            .arg(lease_millis(lease))
            .invoke_async(&mut conn)
            .await?;
        Ok(held == 1)
    }

    async fn mark_active(&self, id: &JobId) -> Result<Transition, BrokerError> {
        let mut conn = self.connection().await?;
        let code: i64 = self
            .mark_active
            .key(self.job_key(id))
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await?;
        Ok(transition_from_code(code))
    }

    async fn complete(&self, id: &JobId, artifact_url: &str) -> Result<Transition, BrokerError> {
        self.finish(id, BrokerState::Completed, "result", artifact_url).await
    }

    async fn fail(&self, id: &JobId, reason: &str) -> Result<Transition, BrokerError> {
        self.finish(id, BrokerState::Failed, "failed_reason", reason).await
    }

    async fn ack(&self, id: &JobId) -> Result<(), BrokerError> {
        let mut conn = self.connection().await?;
        conn.zrem::<_, _, ()>(&self.lease_key, id.as_str()).await?;
        Ok(())
    }

    async fn requeue_expired(&self) -> Result<u64, BrokerError> {
        let mut conn = self.connection().await?;
        let expired: Vec<String> = self
            .expired_leases
            .key(&self.lease_key)
            .invoke_async(&mut conn)
            .await?;

        // Each id is rechecked inside its own script; a renewal that lands
        // between the scan and the move keeps the item in flight.
        let mut moved = 0;
        for raw_id in expired {
            let job_id = JobId::from(raw_id);
            let requeued: i64 = self
                .requeue_expired
                .key(&self.lease_key)
                .key(&self.wait_key)
                .key(self.job_key(&job_id))
                .arg(job_id.as_str())
                .arg(Utc::now().to_rfc3339())
                .invoke_async(&mut conn)
                .await?;
            if requeued == 1 {
                tracing::warn!(job_id = %job_id, "Lease expired, job returned to queue");
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn queue_depth(&self) -> Result<u64, BrokerError> {
        let mut conn = self.connection().await?;
        let depth: u64 = conn.llen(&self.wait_key).await?;
        Ok(depth)
    }

    async fn health_check(&self) -> Result<(), BrokerError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

fn lease_millis(lease: Duration) -> u64 {
    u64::try_from(lease.as_millis()).unwrap_or(u64::MAX)
}

fn transition_from_code(code: i64) -> Transition {
    match code {
        1 => Transition::Applied,
        0 => Transition::AlreadyTerminal,
        _ => Transition::Missing,
    }
}

fn decode_record(id: &JobId, mut fields: HashMap<String, String>) -> Result<JobRecord, BrokerError> {
    let corrupt = |reason: &str| BrokerError::Corrupt {
        id: id.clone(),
        reason: reason.to_string(),
    };

    let input: JobInput = match fields.get("input") {
        Some(raw) => serde_json::from_str(raw).map_err(BrokerError::Serialize)?,
        None => return Err(corrupt("missing input")),
    };
    let state = fields
        .get("state")
        .map(|s| BrokerState::parse(s))
        .ok_or_else(|| corrupt("missing state"))?;
    let attempts = fields
        .get("attempts")
        .map(|a| a.parse::<u32>())
        .transpose()
        .map_err(|_| corrupt("attempts is not a number"))?
        .unwrap_or(0);
    let created_at = parse_timestamp(fields.get("created_at")).ok_or_else(|| corrupt("bad created_at"))?;
    let updated_at = parse_timestamp(fields.get("updated_at")).unwrap_or(created_at);

    Ok(JobRecord {
        id: id.clone(),
        input,
        state,
        result: fields.remove("result"),
        failed_reason: fields.remove("failed_reason"),
        attempts,
        created_at,
        updated_at,
    })
}

fn parse_timestamp(raw: Option<&String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(state: &str) -> HashMap<String, String> {
        HashMap::from([
            ("id".to_string(), "abc".to_string()),
            ("input".to_string(), r#"{"imageUrl":"https://x/j.jpg"}"#.to_string()),
            ("state".to_string(), state.to_string()),
            ("attempts".to_string(), "2".to_string()),
            ("created_at".to_string(), "2026-01-01T00:00:00+00:00".to_string()),
        ])
    }

    #[test]
    fn test_decode_completed_record() {
        let mut fields = stored("completed");
        fields.insert("result".to_string(), "https://x/out.jpg".to_string());

        let record = decode_record(&JobId::from("abc"), fields).unwrap();
        assert_eq!(record.state, BrokerState::Completed);
        assert_eq!(record.result.as_deref(), Some("https://x/out.jpg"));
        assert_eq!(record.failed_reason, None);
        assert_eq!(record.attempts, 2);
        assert_eq!(record.updated_at, record.created_at);
    }

    #[test]
    fn test_decode_rejects_missing_input() {
        let mut fields = stored("waiting");
        fields.remove("input");
        let err = decode_record(&JobId::from("abc"), fields).unwrap_err();
        assert!(matches!(err, BrokerError::Corrupt { .. }));
    }

    #[test]
    fn test_keys_share_hash_tag() {
        let queue = JobQueue::new("redis://localhost:6379", "tryon").unwrap();
        assert_eq!(queue.wait_key, "{tryon}:wait");
        assert_eq!(queue.lease_key, "{tryon}:leases");
        assert_eq!(queue.job_key(&JobId::from("abc")), "{tryon}:job:abc");
    }

    #[test]
    fn test_transition_codes() {
        assert_eq!(transition_from_code(1), Transition::Applied);
        assert_eq!(transition_from_code(0), Transition::AlreadyTerminal);
        assert_eq!(transition_from_code(-1), Transition::Missing);
    }
}
