//! Client side of the job lifecycle: submitting over HTTP and watching a job
//! until it finishes.

pub mod api;
pub mod poller;
pub mod progress;

pub use api::{ApiClient, ClientError, StatusSource};
pub use poller::{FailureCause, Observation, Phase, PollConfig, PollingClient};
pub use progress::ProgressEstimator;
