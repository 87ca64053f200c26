use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::api::{ClientError, StatusSource};
use super::progress::ProgressEstimator;
use crate::models::job::{JobId, JobStatus};

const UNREACHABLE_REASON: &str = "could not reach status service";
const NOT_FOUND_REASON: &str = "job not found";
const TIMED_OUT_REASON: &str = "timed out waiting for job";

/// Where an observed job is, as far as this client knows.
#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    /// No status answer yet.
    Starting,
    Queued,
    Active,
    Completed { result: String },
    Failed { reason: String, cause: FailureCause },
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed { .. } | Phase::Failed { .. })
    }
}

impl From<JobStatus> for Phase {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Queued => Phase::Queued,
            JobStatus::Processing => Phase::Active,
            JobStatus::Completed { result } => Phase::Completed { result },
            JobStatus::Failed { error } => Phase::Failed {
                reason: error,
                cause: FailureCause::Job,
            },
        }
    }
}

/// Why an observation ended in `Failed`.
///
/// Only `Job` means the job itself failed. The others mean this client gave
/// up; the job may still be running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    Job,
    Unreachable,
    NotFound,
    TimedOut,
}

/// Latest view of an observed job.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub job_id: JobId,
    pub phase: Phase,
    /// Estimated completion in `[0, 100]`.
    pub progress: f64,
}

#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Delay between a non-terminal answer and the next query.
    pub poll_interval: Duration,
    /// Random extra delay added to `poll_interval`, up to this much.
    pub jitter: Option<Duration>,
    /// Give up after observing for this long.
    pub max_duration: Option<Duration>,
    pub progress_interval: Duration,
    pub progress: ProgressEstimator,
    /// Fixed RNG seed for reproducible progress and jitter.
    pub seed: Option<u64>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(2000),
            jitter: None,
            max_duration: None,
            progress_interval: Duration::from_secs(1),
            progress: ProgressEstimator::default(),
            seed: None,
        }
    }
}

impl PollConfig {
    fn rng(&self, stream: u64) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(stream)),
            None => StdRng::from_os_rng(),
        }
    }

    fn next_delay(&self, rng: &mut StdRng) -> Duration {
        match self.jitter {
            Some(jitter) if !jitter.is_zero() => {
                let extra = rng.random_range(0..=jitter.as_millis() as u64);
                self.poll_interval + Duration::from_millis(extra)
            }
            _ => self.poll_interval,
        }
    }
}

/// Publishes observation updates until closed.
///
/// Updates and `close` serialize on one lock, so once `close` returns no
/// receiver sees another change.
struct Publisher {
    tx: Mutex<Option<watch::Sender<Observation>>>,
}

impl Publisher {
    /// Apply `change` to the current observation. Returns `false` once closed.
    fn update(&self, change: impl FnOnce(&mut Observation) -> bool) -> bool {
        let guard = self.tx.lock();
        match guard.as_ref() {
            Some(tx) => {
                tx.send_if_modified(change);
                true
            }
            None => false,
        }
    }

    fn close(&self) {
        self.tx.lock().take();
    }
}

struct Running {
    job_id: JobId,
    cancel: CancellationToken,
    publisher: Arc<Publisher>,
    receiver: watch::Receiver<Observation>,
    tasks: [JoinHandle<()>; 2],
}

/// Watches one job at a time by polling its status.
///
/// `start` runs two tasks: a poll loop that queries immediately and then
/// after each non-terminal answer, and a progress ticker on its own
/// interval. Both stop on a terminal answer, on a query error, or on
/// `cancel`. Dropping the client cancels it.
pub struct PollingClient {
    source: Arc<dyn StatusSource>,
    config: PollConfig,
    running: Option<Running>,
}

impl PollingClient {
    pub fn new(source: Arc<dyn StatusSource>, config: PollConfig) -> Self {
        Self {
            source,
            config,
            running: None,
        }
    }

    /// Begin observing `job_id`, replacing any observation in progress.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&mut self, job_id: JobId) -> watch::Receiver<Observation> {
        self.cancel();

        let (tx, receiver) = watch::channel(Observation {
            job_id: job_id.clone(),
            phase: Phase::Starting,
            progress: 0.0,
        });
        let publisher = Arc::new(Publisher {
            tx: Mutex::new(Some(tx)),
        });
        let cancel = CancellationToken::new();

        let poll_task = tokio::spawn(poll_loop(
            self.source.clone(),
            job_id.clone(),
            self.config.clone(),
            publisher.clone(),
            cancel.clone(),
        ));
        let progress_task = tokio::spawn(progress_loop(
            self.config.clone(),
            publisher.clone(),
            cancel.clone(),
        ));

        tracing::debug!(job_id = %job_id, "Started polling job status");
        self.running = Some(Running {
            job_id,
            cancel,
            publisher,
            receiver: receiver.clone(),
            tasks: [poll_task, progress_task],
        });
        receiver
    }

    /// Stop polling and progress updates. Safe to call in any state.
    pub fn cancel(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.cancel.cancel();
        running.publisher.close();
        for task in &running.tasks {
            task.abort();
        }
        tracing::debug!(job_id = %running.job_id, "Stopped polling job status");
    }

    /// Receiver for the current observation, if one was started.
    pub fn subscribe(&self) -> Option<watch::Receiver<Observation>> {
        self.running.as_ref().map(|r| r.receiver.clone())
    }

    /// True while the poll loop or the ticker is still scheduled.
    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|r| r.tasks.iter().any(|t| !t.is_finished()))
    }
}

impl Drop for PollingClient {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn failure(reason: &str, cause: FailureCause) -> Phase {
    Phase::Failed {
        reason: reason.to_string(),
        cause,
    }
}

/// Record a phase change. Returns `true` if polling should stop.
fn settle(publisher: &Publisher, estimator: &ProgressEstimator, phase: Phase) -> bool {
    let terminal = phase.is_terminal();
    let open = publisher.update(|obs| {
        if obs.phase.is_terminal() || obs.phase == phase {
            return false;
        }
        obs.progress = estimator.settle(obs.progress, &phase);
        obs.phase = phase;
        true
    });
    terminal || !open
}

/// Resolves at `deadline`, or never without one.
async fn deadline_reached(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn give_up(job_id: &JobId, publisher: &Publisher, estimator: &ProgressEstimator) {
    tracing::warn!(job_id = %job_id, "Gave up waiting for job");
    settle(publisher, estimator, failure(TIMED_OUT_REASON, FailureCause::TimedOut));
}

async fn poll_loop(
    source: Arc<dyn StatusSource>,
    job_id: JobId,
    config: PollConfig,
    publisher: Arc<Publisher>,
    cancel: CancellationToken,
) {
    let mut rng = config.rng(0);
    let deadline = config.max_duration.map(|d| Instant::now() + d);

    loop {
        let answer = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = deadline_reached(deadline) => {
                give_up(&job_id, &publisher, &config.progress);
                break;
            }
            answer = source.fetch_status(&job_id) => answer,
        };

        let phase = match answer {
            Ok(status) => Phase::from(status),
            Err(ClientError::NotFound(_)) => {
                tracing::warn!(job_id = %job_id, "Job not found, stopping polling");
                failure(NOT_FOUND_REASON, FailureCause::NotFound)
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Polling error, stopping polling");
                failure(UNREACHABLE_REASON, FailureCause::Unreachable)
            }
        };

        if settle(&publisher, &config.progress, phase) {
            tracing::debug!(job_id = %job_id, "Job reached a final state, stopping polling");
            break;
        }

        let delay = config.next_delay(&mut rng);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = deadline_reached(deadline) => {
                give_up(&job_id, &publisher, &config.progress);
                break;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }

    // Stop the ticker too; the final observation stays readable.
    cancel.cancel();
    publisher.close();
}

async fn progress_loop(config: PollConfig, publisher: Arc<Publisher>, cancel: CancellationToken) {
    let mut rng = config.rng(1);
    let period = config.progress_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let mut finished = false;
        let open = publisher.update(|obs| {
            if obs.phase.is_terminal() {
                finished = true;
                return false;
            }
            let next = config.progress.tick(obs.progress, &obs.phase, &mut rng);
            let moved = next > obs.progress;
            obs.progress = next;
            moved
        });
        if finished || !open {
            return;
        }
    }
}
