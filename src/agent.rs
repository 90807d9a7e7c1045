//! Consumer-side workflow: receives jobs for one job type, drives the
//! processing pipeline and settles each delivery exactly once — acknowledge,
//! retry-requeue or dead-letter — publishing at most one result per job.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, warn};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::client::{ClientEvent, DeliveryHandle, IncomingMessage, JobQueueClient};
use crate::config::AgentOptions;
use crate::job::{now_millis, FailureKind, FailureReport, Job, JobResult, RunError, ValidationError};
use crate::transport::Transport;
use crate::Result;

/// Notifications from a [`JobAgent`].
pub enum AgentEvent {
    Ready,
    /// A job was received. The context settles this specific delivery.
    Job { job: Job, ctx: JobContext },
    /// A result was published for a job handled by this agent.
    Result(JobResult),
    Error(crate::Error),
}

impl fmt::Debug for AgentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentEvent::Ready => write!(f, "Ready"),
            AgentEvent::Job { job, .. } => write!(f, "Job({})", job.job_id),
            AgentEvent::Result(result) => write!(f, "Result({})", result.job_id),
            AgentEvent::Error(err) => write!(f, "Error({})", err),
        }
    }
}

/// Domain logic for one job type.
///
/// `validate` screens the raw payload; a failure dead-letters the job with
/// an `INVALID_JOB` result. `run` executes the validated job; a [`RunError`]
/// may request retry semantics. Panics in either are contained and reported
/// as uncaught-exception results.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn validate(&self, data: Value, job: &Job)
        -> std::result::Result<Value, ValidationError>;

    async fn run(&self, data: Value, job: &Job) -> std::result::Result<Value, RunError>;

    /// Hook to adjust the agent configuration this handler runs under.
    fn configure(&self, options: AgentOptions) -> AgentOptions {
        options
    }
}

/// Job consumer scoped to one job type.
#[derive(Clone)]
pub struct JobAgent {
    client: JobQueueClient,
    job_type: Arc<String>,
    options: Arc<AgentOptions>,
}

impl JobAgent {
    /// Connect without a processing pipeline: every job surfaces as an
    /// [`AgentEvent::Job`] and the caller drives the lifecycle itself.
    pub fn connect(
        transport: Arc<dyn Transport>,
        job_type: &str,
        options: AgentOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<AgentEvent>)> {
        Self::build(transport, job_type, None, options)
    }

    /// Connect and drive `handler` for every received job.
    pub fn connect_with_handler(
        transport: Arc<dyn Transport>,
        job_type: &str,
        handler: Arc<dyn JobHandler>,
        options: AgentOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<AgentEvent>)> {
        let options = handler.configure(options);
        Self::build(transport, job_type, Some(handler), options)
    }

    fn build(
        transport: Arc<dyn Transport>,
        job_type: &str,
        handler: Option<Arc<dyn JobHandler>>,
        options: AgentOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<AgentEvent>)> {
        let (client, client_events) =
            JobQueueClient::connect(transport, options.client_options(job_type))?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let agent = Self {
            client,
            job_type: Arc::new(job_type.to_string()),
            options: Arc::new(options),
        };
        let actor = AgentActor {
            client_events,
            event_tx,
            agent: agent.clone(),
            handler,
        };
        tokio::spawn(actor.run());
        Ok((agent, event_rx))
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn options(&self) -> &AgentOptions {
        &self.options
    }

    pub(crate) fn client(&self) -> &JobQueueClient {
        &self.client
    }

    /// Close the underlying client.
    pub async fn end(&self) -> Result<()> {
        debug!("Closing agent for job type {}", self.job_type);
        self.client.end().await
    }
}

struct AgentActor {
    client_events: mpsc::UnboundedReceiver<ClientEvent>,
    event_tx: mpsc::UnboundedSender<AgentEvent>,
    agent: JobAgent,
    handler: Option<Arc<dyn JobHandler>>,
}

impl AgentActor {
    async fn run(mut self) {
        while let Some(event) = self.client_events.recv().await {
            match event {
                ClientEvent::Ready => {
                    let _ = self.event_tx.send(AgentEvent::Ready);
                }
                ClientEvent::Error(err) => {
                    error!("{}", err);
                    let _ = self.event_tx.send(AgentEvent::Error(err));
                }
                ClientEvent::Read(message) => self.on_message(message),
            }
        }
    }

    fn on_message(&self, message: IncomingMessage) {
        debug!("Receiving job");
        let IncomingMessage {
            payload, delivery, ..
        } = message;

        // Build the job view leniently: the type defaults to the agent's own,
        // the retry counter to zero.
        let job = Job {
            at: payload.get("at").and_then(Value::as_i64).unwrap_or(0),
            job_id: payload
                .get("jobId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            job_type: payload
                .get("jobType")
                .and_then(Value::as_str)
                .unwrap_or(self.agent.job_type())
                .to_string(),
            data: payload.get("data").cloned().unwrap_or(Value::Null),
            retry_count: payload
                .get("retryCount")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
        };

        let ctx = JobContext {
            inner: Arc::new(ContextInner {
                job: job.clone(),
                agent: self.agent.clone(),
                delivery,
                responded: AtomicBool::new(false),
                event_tx: self.event_tx.clone(),
            }),
        };

        if let Some(handler) = &self.handler {
            tokio::spawn(drive(handler.clone(), job.clone(), ctx.clone()));
        }

        debug!("Received job {}", job.job_id);
        let _ = self.event_tx.send(AgentEvent::Job { job, ctx });
    }
}

/// Lifecycle operations for one received job. Cloneable; all clones share
/// the same delivery and the same respond-once guard.
#[derive(Clone)]
pub struct JobContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    job: Job,
    agent: JobAgent,
    delivery: DeliveryHandle,
    responded: AtomicBool,
    event_tx: mpsc::UnboundedSender<AgentEvent>,
}

impl JobContext {
    pub fn job(&self) -> &Job {
        &self.inner.job
    }

    pub fn delivery(&self) -> &DeliveryHandle {
        &self.inner.delivery
    }

    fn options(&self) -> &AgentOptions {
        self.inner.agent.options()
    }

    /// Acknowledge the delivery. Idempotent.
    pub async fn acknowledge(&self) -> Result<()> {
        self.inner.delivery.acknowledge().await
    }

    /// Reject the delivery. No-op once the delivery is settled.
    ///
    /// Without `requeue` the message is dead-lettered immediately. With
    /// `requeue`, below the retry limit the job is republished with its
    /// retry counter incremented after `delay` (default: the configured
    /// retry timeout) and the original delivery is acknowledged only once
    /// the republish went out; at the limit the message is dead-lettered.
    pub async fn reject(&self, requeue: bool, delay: Option<Duration>) -> Result<()> {
        self.reject_with_result(requeue, delay, None).await
    }

    async fn reject_with_result(
        &self,
        requeue: bool,
        delay: Option<Duration>,
        result: Option<&Value>,
    ) -> Result<()> {
        let inner = &self.inner;
        if !inner.delivery.settle() {
            return Ok(());
        }

        if !requeue {
            warn!("Dead-letter job {}", inner.job.job_id);
            return inner.delivery.finish_reject(false).await;
        }

        let max_retries = self.options().max_retries;
        if inner.job.retry_count >= max_retries {
            warn!(
                "Dead-letter job {} (retry limit {} reached)",
                inner.job.job_id, max_retries
            );
            return inner.delivery.finish_reject(false).await;
        }

        let delay = delay.unwrap_or(self.options().retry_timeout);
        let message = inner.job.with_retry();
        match result {
            Some(result) => warn!(
                "Job {} republished for retry {} in {:?} (result: {})",
                message.job_id, message.retry_count, delay, result
            ),
            None => warn!(
                "Job {} republished for retry {} in {:?}",
                message.job_id, message.retry_count, delay
            ),
        }

        // Republish to the original read queue and route, then acknowledge.
        // Acking first would lose the message forever if the process died
        // before the republish; this ordering can duplicate instead.
        let ctx = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let inner = &ctx.inner;
            let client = inner.agent.client();
            let options = client.options();
            let read_route = options.read_route.clone();
            let read_queue = options.read_queue.clone();
            match client
                .write(&message, read_route.as_deref(), Some(&read_queue))
                .await
            {
                Ok(()) => {
                    debug!(
                        "Job {} republished, acknowledging original delivery",
                        message.job_id
                    );
                    if let Err(err) = inner.delivery.finish_ack().await {
                        warn!(
                            "Failed to acknowledge original delivery of job {}: {}",
                            message.job_id, err
                        );
                    }
                }
                Err(err) => error!("Failed to republish job {}: {}", message.job_id, err),
            }
        });
        Ok(())
    }

    /// Publish the result for this job, acknowledging first when the
    /// delivery is still pending.
    ///
    /// When `reject_requeue` is given and the delivery is unsettled, the
    /// call delegates to [`reject`](Self::reject) instead (the result is
    /// kept for diagnostics only) and nothing is published.
    ///
    /// # Panics
    ///
    /// Calling `respond` twice on the same job is a usage error and panics.
    pub async fn respond(
        &self,
        data: Value,
        reject_requeue: Option<bool>,
        delay: Option<Duration>,
    ) -> Result<Option<JobResult>> {
        let inner = &self.inner;
        if inner.responded.swap(true, Ordering::SeqCst) {
            panic!("respond() called twice for job {}", inner.job.job_id);
        }

        if inner.delivery.is_pending() {
            if let Some(requeue) = reject_requeue {
                // Rejecting and producing a result are mutually exclusive.
                self.reject_with_result(requeue, delay, Some(&data)).await?;
                return Ok(None);
            }
            inner.delivery.acknowledge().await?;
        }

        let result = JobResult {
            at: now_millis(),
            job_at: inner.job.at,
            job_id: inner.job.job_id.clone(),
            job_type: inner.job.job_type.clone(),
            data,
        };
        debug!("Sending result for job {}", result.job_id);
        inner
            .agent
            .client()
            .write(&result, Some(&result.job_type), None)
            .await?;
        let _ = inner.event_tx.send(AgentEvent::Result(result.clone()));
        Ok(Some(result))
    }
}

/// Validate → run pipeline for one job, mapping every outcome to a single
/// respond call.
async fn drive(handler: Arc<dyn JobHandler>, job: Job, ctx: JobContext) {
    let outcome = {
        let handler = handler.clone();
        let data = job.data.clone();
        let job_view = job.clone();
        tokio::spawn(async move { handler.validate(data, &job_view).await }).await
    };
    let validated = match outcome {
        Ok(Ok(validated)) => validated,
        Ok(Err(err)) => {
            let report = FailureReport::invalid_job(err.to_string(), &job);
            finish(&ctx, report.to_value(), None, None).await;
            return;
        }
        Err(join_err) => {
            let report = FailureReport::uncaught(
                FailureKind::ValidationUncaughtException,
                panic_message(join_err),
                Some(&job),
            );
            finish(&ctx, report.to_value(), None, None).await;
            return;
        }
    };

    let outcome = {
        let handler = handler.clone();
        let job_view = job.clone();
        tokio::spawn(async move { handler.run(validated, &job_view).await }).await
    };
    match outcome {
        Ok(Ok(result)) => {
            finish(&ctx, json!({"success": true, "data": result}), None, None).await;
        }
        Ok(Err(err)) => {
            let reject_requeue = err.reject.then_some(err.requeue);
            let delay = if err.reject {
                err.requeue_delay.or(ctx.options().requeue_delay)
            } else {
                None
            };
            let report = FailureReport::job_failed(err.message.clone(), err.partial_result.clone());
            finish(&ctx, report.to_value(), reject_requeue, delay).await;
        }
        Err(join_err) => {
            let report = FailureReport::uncaught(
                FailureKind::RunUncaughtException,
                panic_message(join_err),
                None,
            );
            finish(&ctx, report.to_value(), None, None).await;
        }
    }
}

async fn finish(
    ctx: &JobContext,
    data: Value,
    reject_requeue: Option<bool>,
    delay: Option<Duration>,
) {
    if let Err(err) = ctx.respond(data, reject_requeue, delay).await {
        error!(
            "Failed to publish result for job {}: {}",
            ctx.job().job_id,
            err
        );
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if err.is_panic() {
        let payload = err.into_panic();
        if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "panic with non-string payload".to_string()
        }
    } else {
        err.to_string()
    }
}
