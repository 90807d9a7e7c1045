//! Producer-side workflow: orders jobs onto the jobs queue and listens for
//! results on the results queue.

use std::fmt;
use std::sync::Arc;

use log::{debug, error};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::client::{ClientEvent, DeliveryHandle, JobQueueClient};
use crate::config::SchedulerOptions;
use crate::job::Job;
use crate::transport::Transport;
use crate::Result;

/// Notifications from a [`JobScheduler`].
pub enum SchedulerEvent {
    Ready,
    /// A job was ordered through this scheduler.
    Job(Job),
    /// A result message was consumed from the results queue.
    Result {
        message: Value,
        delivery: DeliveryHandle,
    },
    Error(crate::Error),
}

impl fmt::Debug for SchedulerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerEvent::Ready => write!(f, "Ready"),
            SchedulerEvent::Job(job) => write!(f, "Job({})", job.job_id),
            SchedulerEvent::Result { .. } => write!(f, "Result"),
            SchedulerEvent::Error(err) => write!(f, "Error({})", err),
        }
    }
}

/// Job producer and result listener.
#[derive(Clone)]
pub struct JobScheduler {
    client: JobQueueClient,
    event_tx: mpsc::UnboundedSender<SchedulerEvent>,
}

impl JobScheduler {
    pub fn connect(
        transport: Arc<dyn Transport>,
        options: SchedulerOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SchedulerEvent>)> {
        let (client, mut client_events) =
            JobQueueClient::connect(transport, options.client_options())?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let forward_tx = event_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = client_events.recv().await {
                let forwarded = match event {
                    ClientEvent::Ready => SchedulerEvent::Ready,
                    ClientEvent::Error(err) => {
                        error!("{}", err);
                        SchedulerEvent::Error(err)
                    }
                    ClientEvent::Read(message) => {
                        debug!("Received result");
                        SchedulerEvent::Result {
                            message: message.payload,
                            delivery: message.delivery,
                        }
                    }
                };
                if forward_tx.send(forwarded).is_err() {
                    break;
                }
            }
        });

        Ok((Self { client, event_tx }, event_rx))
    }

    /// Build a job with a fresh identity and submission time, publish it to
    /// the jobs route suffixed by its type, and return it.
    pub async fn order(&self, job_type: &str, data: Value) -> Result<Job> {
        let job = Job::new(job_type, data);
        debug!("Sending job {}", job.job_id);
        self.client.write(&job, Some(job_type), None).await?;
        let _ = self.event_tx.send(SchedulerEvent::Job(job.clone()));
        Ok(job)
    }

    /// Close the underlying client.
    pub async fn end(&self) -> Result<()> {
        debug!("Closing scheduler");
        self.client.end().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::spin;
    use crate::transport::fake::FakeTransport;
    use serde_json::json;

    async fn boot() -> (
        Arc<FakeTransport>,
        JobScheduler,
        mpsc::UnboundedReceiver<SchedulerEvent>,
    ) {
        let transport = Arc::new(FakeTransport::new());
        let (scheduler, mut events) =
            JobScheduler::connect(transport.clone(), SchedulerOptions::default()).unwrap();
        spin().await;
        assert!(matches!(events.try_recv(), Ok(SchedulerEvent::Ready)));
        (transport, scheduler, events)
    }

    #[tokio::test(start_paused = true)]
    async fn reads_results_and_writes_jobs() {
        let transport = Arc::new(FakeTransport::new());
        let (_scheduler, mut events) =
            JobScheduler::connect(transport.clone(), SchedulerOptions::default()).unwrap();
        spin().await;
        assert!(matches!(events.try_recv(), Ok(SchedulerEvent::Ready)));

        let conn = transport.last_connection();
        assert_eq!(conn.queues(), vec!["results".to_string()]);
        assert_eq!(
            conn.bindings(),
            vec![("results".to_string(), "jobrelay".to_string(), "results.#".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn order_publishes_formatted_job_and_emits_event() {
        let (transport, scheduler, mut events) = boot().await;

        let data = json!({"uri": "http://www.example.com"});
        let job = scheduler.order("pagerank", data.clone()).await.unwrap();
        spin().await;

        assert!(job.at > 0);
        assert!(!job.job_id.is_empty());
        assert_eq!(job.job_type, "pagerank");
        assert_eq!(job.data, data);

        let published = transport.last_connection().published_json();
        assert_eq!(published.len(), 1);
        let (route, message) = &published[0];
        assert_eq!(route, "jobs.pagerank");
        assert_eq!(message["jobId"], json!(job.job_id));
        assert_eq!(message["jobType"], json!("pagerank"));
        assert_eq!(message["data"], data);

        match events.try_recv() {
            Ok(SchedulerEvent::Job(emitted)) => assert_eq!(emitted.job_id, job.job_id),
            other => panic!("expected Job event, got {:?}", other.ok()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_orders_generate_fresh_job_ids() {
        let (_transport, scheduler, _events) = boot().await;

        let first = scheduler.order("pagerank", json!(1)).await.unwrap();
        let second = scheduler.order("pagerank", json!(2)).await.unwrap();
        assert_ne!(first.job_id, second.job_id);
    }

    #[tokio::test(start_paused = true)]
    async fn results_are_reemitted_with_their_delivery() {
        let (transport, _scheduler, mut events) = boot().await;

        let acker = transport.last_connection().deliver_json(
            "results.pagerank",
            &json!({"jobId": "id-1", "data": {"success": true}}),
        );
        spin().await;

        let (message, delivery) = match events.try_recv() {
            Ok(SchedulerEvent::Result { message, delivery }) => (message, delivery),
            other => panic!("expected Result event, got {:?}", other.ok()),
        };
        assert_eq!(message["jobId"], json!("id-1"));

        delivery.acknowledge().await.unwrap();
        assert_eq!(acker.ack_count(), 1);
    }
}
