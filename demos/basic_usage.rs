use std::sync::Arc;

use async_trait::async_trait;
use jobrelay::{AgentOptions, Job, JobHandler, RunError, SchedulerEvent, ValidationError};
use serde_json::{json, Value};

struct WordCount;

#[async_trait]
impl JobHandler for WordCount {
    async fn validate(&self, data: Value, _job: &Job) -> Result<Value, ValidationError> {
        data.get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| ValidationError::from("missing text"))?;
        Ok(data)
    }

    async fn run(&self, data: Value, _job: &Job) -> Result<Value, RunError> {
        let text = data["text"].as_str().unwrap_or_default();
        Ok(json!({"words": text.split_whitespace().count()}))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // Agent pulls jobs routed to "jobs.word-count" and publishes results.
    let (agent, _agent_events) =
        jobrelay::new_agent("word-count", Arc::new(WordCount), AgentOptions::default()).await?;

    // Scheduler orders jobs and listens on the results queue.
    let (scheduler, mut events) = jobrelay::new_scheduler(Default::default()).await?;

    for text in ["hello world", "one two three"] {
        let job = scheduler.order("word-count", json!({"text": text})).await?;
        println!("Ordered job {}", job.job_id);
    }

    let mut seen = 0;
    while let Some(event) = events.recv().await {
        if let SchedulerEvent::Result { message, delivery } = event {
            println!("Result for {}: {}", message["jobId"], message["data"]);
            delivery.acknowledge().await?;
            seen += 1;
            if seen == 2 {
                break;
            }
        }
    }

    agent.end().await?;
    scheduler.end().await?;
    Ok(())
}
