//! A job-queue client layer over a topic-exchange AMQP broker.
//!
//! # Features
//!
//! - **Durable delivery**: persistent messages on durable queues bound to a
//!   durable topic exchange
//! - **Reconnection**: connection drops are retried with a bounded budget,
//!   buffering outbound publishes in the meantime
//! - **Bounded retry**: failed jobs are republished with an incremented
//!   retry counter, then dead-lettered at the limit
//! - **Schedulers and agents**: producers order typed jobs, consumers run
//!   domain logic and publish results back
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use jobrelay::{AgentOptions, Job, JobHandler, RunError, ValidationError};
//! use serde_json::{json, Value};
//!
//! struct Pagerank;
//!
//! #[async_trait]
//! impl JobHandler for Pagerank {
//!     async fn validate(&self, data: Value, _job: &Job) -> Result<Value, ValidationError> {
//!         data.get("uri")
//!             .and_then(Value::as_str)
//!             .ok_or_else(|| ValidationError::from("missing uri"))?;
//!         Ok(data)
//!     }
//!
//!     async fn run(&self, data: Value, _job: &Job) -> Result<Value, RunError> {
//!         let uri = data["uri"].as_str().unwrap();
//!         Ok(json!({"uri": uri, "rank": 0.85}))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Consumer side: pulls jobs routed to "jobs.pagerank".
//!     let (agent, _agent_events) =
//!         jobrelay::new_agent("pagerank", Arc::new(Pagerank), AgentOptions::default()).await?;
//!
//!     // Producer side: orders a job and waits for results.
//!     let (scheduler, mut events) = jobrelay::new_scheduler(Default::default()).await?;
//!     scheduler.order("pagerank", json!({"uri": "http://example.com"})).await?;
//!
//!     while let Some(event) = events.recv().await {
//!         if let jobrelay::SchedulerEvent::Result { message, delivery } = event {
//!             println!("result: {}", message);
//!             delivery.acknowledge().await?;
//!             break;
//!         }
//!     }
//!
//!     agent.end().await?;
//!     scheduler.end().await?;
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod api;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod job;
pub mod scheduler;
pub mod transport;

pub use agent::{AgentEvent, JobAgent, JobContext, JobHandler};
pub use api::{
    default_scheduler, new_agent, new_agent_with_transport, new_scheduler,
    new_scheduler_with_transport,
};
pub use client::{ClientEvent, DeliveryHandle, IncomingMessage, JobQueueClient};
pub use config::{AgentOptions, BrokerOptions, ClientOptions, SchedulerOptions};
pub use connection::{ConnectionEvent, ConnectionOptions, ReconnectingConnection};
pub use error::{Error, Result};
pub use job::{FailureKind, FailureReport, Job, JobResult, RunError, ValidationError};
pub use scheduler::{JobScheduler, SchedulerEvent};
pub use transport::{AmqpTransport, BrokerConnection, MessageAck, RawDelivery, Transport};
