use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobrelay::{AgentEvent, AgentOptions, Job, JobHandler, RunError, ValidationError};
use serde_json::{json, Value};

/// Pretend crawler: transient fetch errors request a retry with a short
/// delay, permanent ones dead-letter the job.
struct Crawler;

#[async_trait]
impl JobHandler for Crawler {
    async fn validate(&self, data: Value, _job: &Job) -> Result<Value, ValidationError> {
        let uri = data
            .get("uri")
            .and_then(Value::as_str)
            .ok_or_else(|| ValidationError::from("missing uri"))?;
        if !uri.starts_with("http") {
            return Err(ValidationError(format!("unsupported scheme in {}", uri)));
        }
        Ok(data)
    }

    async fn run(&self, data: Value, job: &Job) -> Result<Value, RunError> {
        let uri = data["uri"].as_str().unwrap();
        match fetch(uri).await {
            Ok(body) => Ok(json!({"uri": uri, "bytes": body.len()})),
            Err(FetchError::Timeout) => Err(RunError::reject_after(
                format!("timeout fetching {}", uri),
                true,
                Duration::from_secs(5),
            )),
            Err(FetchError::NotFound) => Err(RunError::new(format!("{} not found", uri))),
        }
    }

    fn configure(&self, mut options: AgentOptions) -> AgentOptions {
        options.max_retries = 5;
        options
    }
}

enum FetchError {
    Timeout,
    NotFound,
}

async fn fetch(uri: &str) -> Result<String, FetchError> {
    // Stand-in for a real HTTP client.
    if uri.contains("missing") {
        return Err(FetchError::NotFound);
    }
    Ok(format!("<html>{}</html>", uri))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let (agent, mut events) =
        jobrelay::new_agent("web-crawler", Arc::new(Crawler), AgentOptions::default()).await?;
    println!("Crawler agent ready, waiting for jobs (ctrl-c to quit)");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(AgentEvent::Result(result)) => {
                    println!("Published result for job {}", result.job_id);
                }
                Some(AgentEvent::Error(err)) => {
                    eprintln!("Agent error: {}", err);
                    break;
                }
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    agent.end().await?;
    Ok(())
}
