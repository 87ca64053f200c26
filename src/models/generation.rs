use serde::{Deserialize, Serialize};

use super::job::{ImageRef, JobId, JobInput};

/// Request body for POST /api/generate.
///
/// Accepts both the `imageUrl`/`personImage` names used by the web form and
/// the `primaryImage`/`secondaryImage` names.
#[derive(Debug, Default, Deserialize)]
pub struct GenerateRequest {
    #[serde(rename = "imageUrl", alias = "primaryImage", default)]
    pub image_url: Option<String>,

    #[serde(rename = "personImage", alias = "secondaryImage", default)]
    pub person_image: Option<String>,

    #[serde(default)]
    pub prompt: Option<String>,

    #[serde(default)]
    pub sizing: Option<String>,
}

/// Submission rejected before any job was created.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ValidationError(pub &'static str);

impl GenerateRequest {
    /// Validate the request and build the immutable job payload.
    ///
    /// Blank optional fields are dropped.
    pub fn into_input(self) -> Result<JobInput, ValidationError> {
        let primary_image = self
            .image_url
            .as_deref()
            .and_then(ImageRef::parse)
            .ok_or(ValidationError("Image URL is required"))?;

        Ok(JobInput {
            primary_image,
            secondary_image: self.person_image.as_deref().and_then(ImageRef::parse),
            prompt: non_blank(self.prompt),
            sizing: non_blank(self.sizing),
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Response after a job is accepted.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    pub job_id: JobId,
}

/// Error body shared by all API endpoints.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
