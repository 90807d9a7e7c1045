//! Construction façade: build an agent or scheduler and hand it back only
//! once its first `ready` or `error` event settled the outcome.

use std::sync::Arc;
use std::sync::OnceLock;

use tokio::sync::mpsc;

use crate::agent::{AgentEvent, JobAgent, JobHandler};
use crate::config::{AgentOptions, SchedulerOptions};
use crate::scheduler::{JobScheduler, SchedulerEvent};
use crate::transport::{AmqpTransport, Transport};
use crate::{Error, Result};

static DEFAULT_SCHEDULER: OnceLock<JobScheduler> = OnceLock::new();

/// Start a new agent (job consumer) for `job_type` against the default AMQP
/// transport; resolves once the agent is ready, or with its first error.
pub async fn new_agent(
    job_type: &str,
    handler: Arc<dyn JobHandler>,
    options: AgentOptions,
) -> Result<(JobAgent, mpsc::UnboundedReceiver<AgentEvent>)> {
    new_agent_with_transport(Arc::new(AmqpTransport), job_type, handler, options).await
}

/// [`new_agent`] with an injected transport.
pub async fn new_agent_with_transport(
    transport: Arc<dyn Transport>,
    job_type: &str,
    handler: Arc<dyn JobHandler>,
    options: AgentOptions,
) -> Result<(JobAgent, mpsc::UnboundedReceiver<AgentEvent>)> {
    let (agent, mut events) = JobAgent::connect_with_handler(transport, job_type, handler, options)?;
    first_ready_or_error(&mut events, |event| match event {
        AgentEvent::Ready => Some(Ok(())),
        AgentEvent::Error(err) => Some(Err(err)),
        _ => None,
    })
    .await?;
    Ok((agent, events))
}

/// Start a new scheduler (job producer) against the default AMQP transport;
/// resolves once the scheduler is ready, or with its first error. The first
/// scheduler created successfully becomes the process-wide default.
pub async fn new_scheduler(
    options: SchedulerOptions,
) -> Result<(JobScheduler, mpsc::UnboundedReceiver<SchedulerEvent>)> {
    new_scheduler_with_transport(Arc::new(AmqpTransport), options).await
}

/// [`new_scheduler`] with an injected transport.
pub async fn new_scheduler_with_transport(
    transport: Arc<dyn Transport>,
    options: SchedulerOptions,
) -> Result<(JobScheduler, mpsc::UnboundedReceiver<SchedulerEvent>)> {
    let (scheduler, mut events) = JobScheduler::connect(transport, options)?;
    first_ready_or_error(&mut events, |event| match event {
        SchedulerEvent::Ready => Some(Ok(())),
        SchedulerEvent::Error(err) => Some(Err(err)),
        _ => None,
    })
    .await?;
    let _ = DEFAULT_SCHEDULER.set(scheduler.clone());
    Ok((scheduler, events))
}

/// The first scheduler created through [`new_scheduler`], if any.
pub fn default_scheduler() -> Option<JobScheduler> {
    DEFAULT_SCHEDULER.get().cloned()
}

/// Wait for whichever of the first ready or first error settles the
/// construction outcome.
async fn first_ready_or_error<E>(
    events: &mut mpsc::UnboundedReceiver<E>,
    classify: impl Fn(E) -> Option<Result<()>>,
) -> Result<()> {
    while let Some(event) = events.recv().await {
        if let Some(outcome) = classify(event) {
            return outcome;
        }
    }
    Err(Error::ClosedError)
}
