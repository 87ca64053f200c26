use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Redis connection string for the job queue
    pub redis_url: String,

    /// Queue name; prefixes every Redis key
    #[serde(default = "default_queue_name")]
    pub queue_name: String,

    /// Image-generation model endpoint. Required by the worker only.
    pub generator_url: Option<String>,

    /// Bearer token for the model endpoint
    pub generator_api_token: Option<String>,

    /// Worker sleep between empty queue checks
    #[serde(default = "default_worker_poll_interval_ms")]
    pub worker_poll_interval_ms: u64,

    /// How long a claimed job stays reserved without a lease renewal
    #[serde(default = "default_worker_lease_secs")]
    pub worker_lease_secs: u64,
}

/// Settings for processes that only talk to the HTTP API, such as `watch`.
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_queue_name() -> String {
    "image-generation".to_string()
}

fn default_worker_poll_interval_ms() -> u64 {
    1000
}

fn default_worker_lease_secs() -> u64 {
    60
}

fn default_api_base_url() -> String {
    "http://localhost:3000".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    /// Same as [`from_env`](Self::from_env) without loading `.env`.
    pub fn from_vars<I>(vars: I) -> Result<Self, envy::Error>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        envy::from_iter(vars)
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn from_vars<I>(vars: I) -> Result<Self, envy::Error>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        envy::from_iter(vars)
    }
}
