//! Submit a generation job, or watch an existing one, from the terminal.
//!
//! Usage:
//!   watch <job-id>
//!   watch --submit <image-url> [prompt]
//!
//! Reads API_BASE_URL (default http://localhost:3000).

use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use tryon_jobs::client::{ApiClient, FailureCause, Phase, PollConfig, PollingClient};
use tryon_jobs::config::ClientConfig;
use tryon_jobs::models::job::{ImageRef, JobId, JobInput};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let config = ClientConfig::from_env()?;
    let api = Arc::new(ApiClient::new(&config.api_base_url)?);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let job_id = match args.as_slice() {
        [flag, image, rest @ ..] if flag == "--submit" => {
            let input = JobInput {
                primary_image: ImageRef::parse(image).ok_or("image URL must not be blank")?,
                secondary_image: None,
                prompt: rest.first().cloned(),
                sizing: None,
            };
            let id = api.submit(&input).await?;
            println!("Submitted job {id}");
            id
        }
        [id] => JobId::from(id.as_str()),
        _ => {
            eprintln!("usage: watch <job-id> | watch --submit <image-url> [prompt]");
            std::process::exit(2);
        }
    };

    let mut client = PollingClient::new(api, PollConfig::default());
    let mut updates = client.start(job_id);

    let mut last_printed = -1.0;
    loop {
        let observation = updates.borrow_and_update().clone();
        if observation.progress.round() != last_printed {
            last_printed = observation.progress.round();
            println!("{:>3}%  {:?}", last_printed, observation.phase);
        }

        match observation.phase {
            Phase::Completed { result } => {
                println!("Result: {result}");
                return Ok(());
            }
            Phase::Failed { reason, cause } => {
                match cause {
                    FailureCause::Job => eprintln!("Job failed: {reason}"),
                    _ => eprintln!("Stopped watching: {reason}"),
                }
                std::process::exit(1);
            }
            _ => {}
        }

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    // Publisher closed; loop once more to print the final state.
                    let last = updates.borrow().clone();
                    if !last.phase.is_terminal() {
                        return Err("observation ended without a final state".into());
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                client.cancel();
                eprintln!("Cancelled");
                return Ok(());
            }
        }
    }
}
