//! Test helper utilities shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use tryon_jobs::client::{ClientError, StatusSource};
use tryon_jobs::models::generation::GenerateRequest;
use tryon_jobs::models::job::{ImageRef, JobId, JobInput, JobStatus};
use tryon_jobs::services::generator::{GenerationError, Generator};
use tryon_jobs::services::status::{StatusError, StatusService};

pub const SOURCE_IMAGE: &str = "https://x/j.jpg";
pub const ARTIFACT_URL: &str = "https://x/out.jpg";

pub fn sample_request() -> GenerateRequest {
    GenerateRequest {
        image_url: Some(SOURCE_IMAGE.to_string()),
        prompt: Some("studio photo".to_string()),
        ..Default::default()
    }
}

pub fn sample_input() -> JobInput {
    JobInput {
        primary_image: ImageRef::Url(SOURCE_IMAGE.to_string()),
        secondary_image: None,
        prompt: Some("studio photo".to_string()),
        sizing: None,
    }
}

/// Generator with a fixed outcome and an optional simulated runtime.
pub struct StubGenerator {
    outcome: Result<String, String>,
    delay: Duration,
    calls: AtomicUsize,
}

impl StubGenerator {
    pub fn succeeding(url: &str) -> Self {
        Self {
            outcome: Ok(url.to_string()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            outcome: Err(reason.to_string()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn taking(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for StubGenerator {
    async fn generate(&self, _input: &JobInput) -> Result<String, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.outcome.clone().map_err(GenerationError::Rejected)
    }
}

/// One scripted answer from [`ScriptedSource`].
#[derive(Debug, Clone)]
pub enum Answer {
    Status(JobStatus),
    NotFound,
    Unavailable,
    /// Never answers.
    Hang,
}

/// Status source that replays a script, repeating the last answer forever.
pub struct ScriptedSource {
    script: Vec<Answer>,
    calls: Mutex<HashMap<JobId, Vec<Instant>>>,
}

impl ScriptedSource {
    pub fn new(script: Vec<Answer>) -> Arc<Self> {
        assert!(!script.is_empty());
        Arc::new(Self {
            script,
            calls: Mutex::new(HashMap::new()),
        })
    }

    pub fn calls(&self, job_id: &str) -> Vec<Instant> {
        self.calls
            .lock()
            .get(&JobId::from(job_id))
            .cloned()
            .unwrap_or_default()
    }

    pub fn call_count(&self, job_id: &str) -> usize {
        self.calls(job_id).len()
    }
}

#[async_trait]
impl StatusSource for ScriptedSource {
    async fn fetch_status(&self, job_id: &JobId) -> Result<JobStatus, ClientError> {
        let index = {
            let mut calls = self.calls.lock();
            let seen = calls.entry(job_id.clone()).or_default();
            seen.push(Instant::now());
            seen.len() - 1
        };

        match self.script[index.min(self.script.len() - 1)].clone() {
            Answer::Status(status) => Ok(status),
            Answer::NotFound => Err(ClientError::NotFound(job_id.clone())),
            Answer::Unavailable => Err(ClientError::Rejected {
                status: 503,
                message: "Service Unavailable".to_string(),
            }),
            Answer::Hang => std::future::pending().await,
        }
    }
}

/// Status source reading straight from a [`StatusService`], no HTTP.
pub struct ServiceSource(pub Arc<StatusService>);

#[async_trait]
impl StatusSource for ServiceSource {
    async fn fetch_status(&self, job_id: &JobId) -> Result<JobStatus, ClientError> {
        match self.0.get_status(job_id).await {
            Ok(snapshot) => Ok(snapshot.status),
            Err(StatusError::NotFound(id)) => Err(ClientError::NotFound(id)),
            Err(StatusError::Broker(e)) => Err(ClientError::Rejected {
                status: 500,
                message: e.to_string(),
            }),
        }
    }
}

pub fn completed() -> JobStatus {
    JobStatus::Completed {
        result: ARTIFACT_URL.to_string(),
    }
}

pub fn failed(reason: &str) -> JobStatus {
    JobStatus::Failed {
        error: reason.to_string(),
    }
}
