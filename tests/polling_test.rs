//! PollingClient behaviour under a paused Tokio clock.

mod helpers;

use helpers::*;
use std::time::Duration;
use tokio::time::{sleep, Instant};

use std::sync::Arc;
use tryon_jobs::client::{
    ApiClient, ClientError, FailureCause, Observation, Phase, PollConfig, PollingClient,
    StatusSource,
};
use tryon_jobs::models::job::{JobId, JobStatus};

fn seeded() -> PollConfig {
    PollConfig {
        seed: Some(42),
        ..PollConfig::default()
    }
}

async fn wait_terminal(rx: &mut tokio::sync::watch::Receiver<Observation>) -> Observation {
    rx.wait_for(|obs| obs.phase.is_terminal())
        .await
        .expect("observation closed before a final state")
        .clone()
}

#[tokio::test(start_paused = true)]
async fn test_queries_immediately_then_every_two_seconds() {
    let source = ScriptedSource::new(vec![
        Answer::Status(JobStatus::Queued),
        Answer::Status(JobStatus::Queued),
        Answer::Status(JobStatus::Processing),
        Answer::Status(completed()),
    ]);
    let start = Instant::now();
    let mut client = PollingClient::new(source.clone(), seeded());
    let mut rx = client.start(JobId::from("abc"));

    let done = wait_terminal(&mut rx).await;
    assert_eq!(
        done.phase,
        Phase::Completed {
            result: ARTIFACT_URL.to_string()
        }
    );
    assert_eq!(done.progress, 100.0);

    let offsets: Vec<Duration> = source.calls("abc").iter().map(|t| *t - start).collect();
    assert_eq!(
        offsets,
        vec![
            Duration::ZERO,
            Duration::from_secs(2),
            Duration::from_secs(4),
            Duration::from_secs(6),
        ]
    );

    // Nothing runs after the final state.
    sleep(Duration::from_secs(30)).await;
    assert_eq!(source.call_count("abc"), 4);
    assert!(!client.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_progress_is_monotonic_and_capped() {
    let source = ScriptedSource::new(vec![Answer::Status(JobStatus::Queued)]);
    let mut client = PollingClient::new(source, seeded());
    let rx = client.start(JobId::from("abc"));

    let mut last = 0.0;
    for _ in 0..120 {
        sleep(Duration::from_millis(500)).await;
        let obs = rx.borrow().clone();
        assert_eq!(obs.phase, Phase::Queued);
        assert!(obs.progress >= last, "progress went from {last} to {}", obs.progress);
        assert!(obs.progress <= 90.0);
        last = obs.progress;
    }
    assert!(last > 0.0);
    client.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_active_jobs_use_higher_cap() {
    let source = ScriptedSource::new(vec![Answer::Status(JobStatus::Processing)]);
    let mut client = PollingClient::new(source, seeded());
    let rx = client.start(JobId::from("abc"));

    sleep(Duration::from_secs(120)).await;
    let obs = rx.borrow().clone();
    assert_eq!(obs.phase, Phase::Active);
    assert!(obs.progress > 90.0 && obs.progress <= 95.0, "progress {}", obs.progress);
}

#[tokio::test(start_paused = true)]
async fn test_job_failure_freezes_progress() {
    let source = ScriptedSource::new(vec![
        Answer::Status(JobStatus::Processing),
        Answer::Status(JobStatus::Processing),
        Answer::Status(JobStatus::Processing),
        Answer::Status(failed("model timeout")),
    ]);
    let mut client = PollingClient::new(source.clone(), seeded());
    let mut rx = client.start(JobId::from("abc"));

    let done = wait_terminal(&mut rx).await;
    assert_eq!(
        done.phase,
        Phase::Failed {
            reason: "model timeout".to_string(),
            cause: FailureCause::Job,
        }
    );
    assert!(done.progress > 0.0 && done.progress < 100.0);

    sleep(Duration::from_secs(20)).await;
    assert_eq!(rx.borrow().progress, done.progress);
    assert_eq!(source.call_count("abc"), 4);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_service_stops_without_retry() {
    let source = ScriptedSource::new(vec![
        Answer::Status(JobStatus::Processing),
        Answer::Unavailable,
        Answer::Status(completed()),
    ]);
    let mut client = PollingClient::new(source.clone(), seeded());
    let mut rx = client.start(JobId::from("abc"));

    let done = wait_terminal(&mut rx).await;
    assert_eq!(
        done.phase,
        Phase::Failed {
            reason: "could not reach status service".to_string(),
            cause: FailureCause::Unreachable,
        }
    );
    assert!(done.progress < 100.0);

    sleep(Duration::from_secs(30)).await;
    assert_eq!(source.call_count("abc"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_job_stops_polling() {
    let source = ScriptedSource::new(vec![Answer::NotFound]);
    let mut client = PollingClient::new(source.clone(), seeded());
    let mut rx = client.start(JobId::from("unknown-id"));

    let done = wait_terminal(&mut rx).await;
    assert!(matches!(
        done.phase,
        Phase::Failed {
            cause: FailureCause::NotFound,
            ..
        }
    ));
    sleep(Duration::from_secs(10)).await;
    assert_eq!(source.call_count("unknown-id"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_queries_and_updates() {
    let source = ScriptedSource::new(vec![Answer::Status(JobStatus::Processing)]);
    let mut client = PollingClient::new(source.clone(), seeded());
    let rx = client.start(JobId::from("abc"));

    sleep(Duration::from_millis(5500)).await;
    client.cancel();
    let calls = source.call_count("abc");
    let frozen = rx.borrow().clone();
    assert_eq!(calls, 3);

    sleep(Duration::from_secs(30)).await;
    assert_eq!(source.call_count("abc"), calls);
    assert_eq!(*rx.borrow(), frozen);
    assert!(rx.has_changed().is_err(), "publisher should be closed");
    assert!(!client.is_running());

    // Idempotent.
    client.cancel();
    client.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_cancel_before_start_is_noop() {
    let source = ScriptedSource::new(vec![Answer::Status(JobStatus::Queued)]);
    let mut client = PollingClient::new(source, seeded());
    client.cancel();
    assert!(client.subscribe().is_none());
    assert!(!client.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_restart_replaces_previous_observation() {
    let source = ScriptedSource::new(vec![Answer::Status(JobStatus::Queued)]);
    let mut client = PollingClient::new(source.clone(), seeded());

    let first = client.start(JobId::from("abc"));
    sleep(Duration::from_millis(4500)).await;
    let second = client.start(JobId::from("abc"));
    let restarted_at = Instant::now();
    sleep(Duration::from_millis(4500)).await;

    // Old loop: 0s, 2s, 4s. New loop: 4.5s, 6.5s, 8.5s.
    let calls = source.calls("abc");
    assert_eq!(calls.len(), 6);
    assert!(first.has_changed().is_err());
    assert!(second.has_changed().is_ok());
    assert_eq!(calls.iter().filter(|t| **t >= restarted_at).count(), 3);
    assert_eq!(second.borrow().job_id, JobId::from("abc"));
}

#[tokio::test(start_paused = true)]
async fn test_drop_cancels() {
    let source = ScriptedSource::new(vec![Answer::Status(JobStatus::Queued)]);
    let mut client = PollingClient::new(source.clone(), seeded());
    let _rx = client.start(JobId::from("abc"));
    sleep(Duration::from_millis(100)).await;
    drop(client);

    sleep(Duration::from_secs(10)).await;
    assert_eq!(source.call_count("abc"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_max_duration_gives_up() {
    let source = ScriptedSource::new(vec![Answer::Status(JobStatus::Queued)]);
    let config = PollConfig {
        max_duration: Some(Duration::from_secs(5)),
        ..seeded()
    };
    let mut client = PollingClient::new(source.clone(), config);
    let mut rx = client.start(JobId::from("abc"));

    let done = wait_terminal(&mut rx).await;
    assert_eq!(
        done.phase,
        Phase::Failed {
            reason: "timed out waiting for job".to_string(),
            cause: FailureCause::TimedOut,
        }
    );
    // 0s, 2s, 4s; the deadline fires during the wait before the 6s query.
    assert_eq!(source.call_count("abc"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_max_duration_covers_a_hung_query() {
    let source = ScriptedSource::new(vec![Answer::Hang]);
    let config = PollConfig {
        max_duration: Some(Duration::from_secs(5)),
        ..seeded()
    };
    let start = Instant::now();
    let mut client = PollingClient::new(source.clone(), config);
    let mut rx = client.start(JobId::from("abc"));

    let done = wait_terminal(&mut rx).await;
    assert_eq!(
        done.phase,
        Phase::Failed {
            reason: "timed out waiting for job".to_string(),
            cause: FailureCause::TimedOut,
        }
    );
    let waited = Instant::now() - start;
    assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(6), "waited {waited:?}");
    assert!(done.progress < 100.0);

    sleep(Duration::from_secs(10)).await;
    assert_eq!(source.call_count("abc"), 1);
    assert!(!client.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_jitter_stretches_the_interval() {
    let source = ScriptedSource::new(vec![Answer::Status(JobStatus::Queued)]);
    let config = PollConfig {
        jitter: Some(Duration::from_millis(500)),
        ..seeded()
    };
    let start = Instant::now();
    let mut client = PollingClient::new(source.clone(), config);
    let _rx = client.start(JobId::from("abc"));

    sleep(Duration::from_secs(30)).await;
    client.cancel();

    let calls = source.calls("abc");
    assert_eq!(calls[0] - start, Duration::ZERO);
    for pair in calls.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap >= Duration::from_secs(2) && gap <= Duration::from_millis(2500), "gap {gap:?}");
    }
}

#[tokio::test]
async fn test_refused_connection_reads_as_unreachable() {
    // Nothing listens on port 1.
    let api = Arc::new(ApiClient::with_timeout("http://127.0.0.1:1", Duration::from_secs(5)).unwrap());
    let err = api.fetch_status(&JobId::from("abc")).await.unwrap_err();
    assert!(matches!(err, ClientError::Transport(_)), "got {err:?}");

    let mut client = PollingClient::new(api, seeded());
    let mut rx = client.start(JobId::from("abc"));
    let done = wait_terminal(&mut rx).await;
    assert_eq!(
        done.phase,
        Phase::Failed {
            reason: "could not reach status service".to_string(),
            cause: FailureCause::Unreachable,
        }
    );
    assert!(done.progress < 100.0);
}
