use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::Display;
use uuid::Uuid;

/// Opaque job identifier, assigned once at submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Allocate a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Reference to an input image: either a remote URL or an inline `data:` URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ImageRef {
    Url(String),
    Inline(String),
}

impl ImageRef {
    /// Classify a raw reference. Blank input yields `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        Some(Self::from(raw.to_string()))
    }

    pub fn is_inline(&self) -> bool {
        matches!(self, ImageRef::Inline(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            ImageRef::Url(s) | ImageRef::Inline(s) => s,
        }
    }
}

impl From<String> for ImageRef {
    fn from(value: String) -> Self {
        if value.starts_with("data:") {
            ImageRef::Inline(value)
        } else {
            ImageRef::Url(value)
        }
    }
}

impl From<ImageRef> for String {
    fn from(value: ImageRef) -> Self {
        match value {
            ImageRef::Url(s) | ImageRef::Inline(s) => s,
        }
    }
}

/// Immutable generation payload carried by a job.
///
/// Serialized with the field names the model endpoint expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInput {
    #[serde(rename = "imageUrl")]
    pub primary_image: ImageRef,

    #[serde(rename = "personImage", default, skip_serializing_if = "Option::is_none")]
    pub secondary_image: Option<ImageRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sizing: Option<String>,
}

/// Public lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Queued,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Client-facing status payload.
///
/// The outcome lives inside the terminal variants, so a result without
/// `completed` (or a reason without `failed`) cannot be expressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed { result: String },
    Failed { error: String },
}

impl JobStatus {
    pub fn state(&self) -> JobState {
        match self {
            JobStatus::Queued => JobState::Queued,
            JobStatus::Processing => JobState::Active,
            JobStatus::Completed { .. } => JobState::Completed,
            JobStatus::Failed { .. } => JobState::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }
}

/// Point-in-time read of a job. Callers re-query to observe changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSnapshot {
    pub id: JobId,
    pub status: JobStatus,
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}
