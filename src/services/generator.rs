use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

use crate::models::job::JobInput;

/// The image-generation model, seen from the worker.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Run one generation and return the URL of the produced image.
    async fn generate(&self, input: &JobInput) -> Result<String, GenerationError>;
}

/// Client for an HTTP model endpoint.
///
/// The job input is posted as JSON; the endpoint answers with
/// `{ "imageUrl": "..." }`.
pub struct HttpGenerator {
    http: Client,
    endpoint: String,
    api_token: Option<String>,
}

#[derive(Deserialize)]
struct GenerateOutput {
    #[serde(rename = "imageUrl")]
    image_url: Option<String>,
    error: Option<String>,
}

impl HttpGenerator {
    pub fn new(endpoint: &str, api_token: Option<String>) -> Result<Self, GenerationError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(GenerationError::Http)?;
        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
            api_token,
        })
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(&self, input: &JobInput) -> Result<String, GenerationError> {
        let mut request = self.http.post(&self.endpoint).json(input);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(GenerationError::Http)?;
        let status = response.status();
        let body = response.text().await.map_err(GenerationError::Http)?;
        read_output(status, &body)
    }
}

/// Turn a model endpoint response into the produced image URL.
fn read_output(status: StatusCode, body: &str) -> Result<String, GenerationError> {
    if !status.is_success() {
        let reason = serde_json::from_str::<GenerateOutput>(body)
            .ok()
            .and_then(|output| output.error)
            .unwrap_or_else(|| format!("model endpoint returned {status}"));
        return Err(GenerationError::Rejected(reason));
    }

    let output: GenerateOutput = serde_json::from_str(body).map_err(GenerationError::Parse)?;
    match output.image_url {
        Some(url) if !url.trim().is_empty() => Ok(url),
        _ => Err(GenerationError::Rejected(
            output.error.unwrap_or_else(|| "model returned no image".to_string()),
        )),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Rejected(String),

    #[error("Failed to parse model response: {0}")]
    Parse(#[from] serde_json::Error),
}
