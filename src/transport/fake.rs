//! Scripted in-memory broker used by the unit tests: records topology and
//! publishes, injects deliveries, and drops connections on demand.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use super::{BrokerConnection, MessageAck, RawDelivery, Transport};
use crate::config::BrokerOptions;
use crate::{Error, Result};

pub(crate) struct FakeTransport {
    fail_next: AtomicUsize,
    connects: AtomicUsize,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            fail_next: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn last_connection(&self) -> Arc<FakeConnection> {
        self.connections
            .lock()
            .unwrap()
            .last()
            .expect("no connection was established")
            .clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, _options: &BrokerOptions) -> Result<Box<dyn BrokerConnection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let scripted_failure = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure {
            return Err(Error::ConnectionError("connection refused".to_string()));
        }

        let connection = Arc::new(FakeConnection::new());
        self.connections.lock().unwrap().push(connection.clone());
        Ok(Box::new(FakeHandle(connection)))
    }
}

struct FakeConsumer {
    queue: String,
    prefetch: u16,
    tx: mpsc::UnboundedSender<RawDelivery>,
}

pub(crate) struct FakeConnection {
    exchanges: Mutex<Vec<String>>,
    queues: Mutex<Vec<String>>,
    bindings: Mutex<Vec<(String, String, String)>>,
    published: Mutex<Vec<(String, String, Vec<u8>)>>,
    consumers: Mutex<Vec<FakeConsumer>>,
    fail_publishes: AtomicBool,
    closed_tx: watch::Sender<Option<String>>,
    closed_rx: watch::Receiver<Option<String>>,
}

impl FakeConnection {
    fn new() -> Self {
        let (closed_tx, closed_rx) = watch::channel(None);
        Self {
            exchanges: Mutex::new(Vec::new()),
            queues: Mutex::new(Vec::new()),
            bindings: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
            fail_publishes: AtomicBool::new(false),
            closed_tx,
            closed_rx,
        }
    }

    /// Simulate an unexpected connection loss.
    pub fn drop_connection(&self, reason: &str) {
        let _ = self.closed_tx.send(Some(reason.to_string()));
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    fn is_dropped(&self) -> bool {
        self.closed_rx.borrow().is_some()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_dropped() {
            return Err(Error::ConnectionError("connection lost".to_string()));
        }
        Ok(())
    }

    /// Inject a delivery into the first subscribed consumer.
    pub fn deliver(&self, routing_key: &str, payload: &[u8]) -> Arc<FakeAcker> {
        let acker = Arc::new(FakeAcker::default());
        let consumers = self.consumers.lock().unwrap();
        let consumer = consumers.first().expect("no consumer subscribed");
        consumer
            .tx
            .send(RawDelivery {
                routing_key: routing_key.to_string(),
                payload: payload.to_vec(),
                acker: acker.clone(),
            })
            .expect("consumer receiver dropped");
        acker
    }

    pub fn deliver_json(&self, routing_key: &str, value: &Value) -> Arc<FakeAcker> {
        self.deliver(routing_key, &serde_json::to_vec(value).unwrap())
    }

    pub fn exchanges(&self) -> Vec<String> {
        self.exchanges.lock().unwrap().clone()
    }

    pub fn queues(&self) -> Vec<String> {
        self.queues.lock().unwrap().clone()
    }

    pub fn bindings(&self) -> Vec<(String, String, String)> {
        self.bindings.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<(String, String, Vec<u8>)> {
        self.published.lock().unwrap().clone()
    }

    /// Published messages as `(routing_key, decoded payload)`.
    pub fn published_json(&self) -> Vec<(String, Value)> {
        self.published()
            .into_iter()
            .map(|(_, routing_key, payload)| {
                (routing_key, serde_json::from_slice(&payload).unwrap())
            })
            .collect()
    }

    pub fn consumer_queues(&self) -> Vec<String> {
        self.consumers
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.queue.clone())
            .collect()
    }

    pub fn consumer_prefetch(&self) -> Option<u16> {
        self.consumers.lock().unwrap().first().map(|c| c.prefetch)
    }
}

struct FakeHandle(Arc<FakeConnection>);

#[async_trait]
impl BrokerConnection for FakeHandle {
    async fn declare_exchange(&self, name: &str) -> Result<()> {
        self.0.ensure_live()?;
        self.0.exchanges.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> Result<()> {
        self.0.ensure_live()?;
        self.0.queues.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        self.0.ensure_live()?;
        self.0.bindings.lock().unwrap().push((
            queue.to_string(),
            exchange.to_string(),
            pattern.to_string(),
        ));
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<mpsc::UnboundedReceiver<RawDelivery>> {
        self.0.ensure_live()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.0.consumers.lock().unwrap().push(FakeConsumer {
            queue: queue.to_string(),
            prefetch,
            tx,
        });
        Ok(rx)
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        self.0.ensure_live()?;
        if self.0.fail_publishes.load(Ordering::SeqCst) {
            return Err(Error::PublishError("channel unavailable".to_string()));
        }
        self.0.published.lock().unwrap().push((
            exchange.to_string(),
            routing_key.to_string(),
            payload.to_vec(),
        ));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn closed(&self) -> String {
        let mut closed = self.0.closed_rx.clone();
        loop {
            if let Some(reason) = closed.borrow_and_update().clone() {
                return reason;
            }
            if closed.changed().await.is_err() {
                return "connection dropped".to_string();
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeAcker {
    acks: AtomicUsize,
    rejects: Mutex<Vec<bool>>,
}

impl FakeAcker {
    pub fn ack_count(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }

    pub fn is_acked(&self) -> bool {
        self.ack_count() > 0
    }

    pub fn reject_count(&self) -> usize {
        self.rejects.lock().unwrap().len()
    }

    pub fn last_reject_requeue(&self) -> Option<bool> {
        self.rejects.lock().unwrap().last().copied()
    }
}

#[async_trait]
impl MessageAck for FakeAcker {
    async fn ack(&self) -> Result<()> {
        self.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.rejects.lock().unwrap().push(requeue);
        Ok(())
    }
}
