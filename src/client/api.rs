use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;

use crate::models::generation::{ErrorResponse, GenerateResponse};
use crate::models::job::{JobId, JobInput, JobStatus};

/// Where a polling client reads job status from.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch_status(&self, job_id: &JobId) -> Result<JobStatus, ClientError>;
}

/// Upper bound on a single API request, so a stalled server reads as a
/// transport failure instead of hanging the caller.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for the generation API.
pub struct ApiClient {
    http: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        Self::with_timeout(base_url, REQUEST_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ClientError::Transport)?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// POST /api/generate
    pub async fn submit(&self, input: &JobInput) -> Result<JobId, ClientError> {
        let response = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .json(input)
            .send()
            .await
            .map_err(ClientError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<ErrorResponse>()
                .await
                .map(|body| body.error)
                .unwrap_or_else(|_| status.to_string());
            return Err(ClientError::Rejected { status: status.as_u16(), message });
        }

        let body: GenerateResponse = response.json().await.map_err(ClientError::Decode)?;
        Ok(body.job_id)
    }
}

#[async_trait]
impl StatusSource for ApiClient {
    /// GET /api/status/{job_id}
    async fn fetch_status(&self, job_id: &JobId) -> Result<JobStatus, ClientError> {
        let response = self
            .http
            .get(format!("{}/api/status/{}", self.base_url, job_id))
            .send()
            .await
            .map_err(ClientError::Transport)?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(ClientError::NotFound(job_id.clone())),
            status if !status.is_success() => Err(ClientError::Rejected {
                status: status.as_u16(),
                message: "Failed to fetch job status".to_string(),
            }),
            _ => response.json().await.map_err(ClientError::Decode),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("Job {0} not found")]
    NotFound(JobId),

    #[error("Server returned {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Failed to decode response: {0}")]
    Decode(#[source] reqwest::Error),
}
