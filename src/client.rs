//! Generic bidirectional queue client: binds a durable queue to a topic
//! exchange for reading and publishes persistent messages for writing.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use log::{debug, error, warn};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::config::ClientOptions;
use crate::connection::{ConnectionEvent, ConnectionOptions, ReconnectingConnection};
use crate::transport::{BrokerConnection, MessageAck, RawDelivery, Transport};
use crate::{Error, Result};

/// Notifications from a [`JobQueueClient`].
pub enum ClientEvent {
    /// Fired once, after the connection is live and the topic exchange and
    /// read queue are declared.
    Ready,
    /// A message was consumed from the read queue.
    Read(IncomingMessage),
    /// A connection-level error, including the terminal reconnection
    /// failure.
    Error(Error),
}

impl fmt::Debug for ClientEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientEvent::Ready => write!(f, "Ready"),
            ClientEvent::Read(message) => write!(f, "Read({})", message.routing_key),
            ClientEvent::Error(err) => write!(f, "Error({})", err),
        }
    }
}

/// One consumed message: decoded payload, routing metadata and the
/// acknowledgment handle bound to this specific delivery.
pub struct IncomingMessage {
    pub payload: Value,
    pub routing_key: String,
    pub delivery: DeliveryHandle,
}

const PENDING: u8 = 0;
const SETTLING: u8 = 1;
const ACKNOWLEDGED: u8 = 2;
const REJECTED: u8 = 3;

/// Per-delivery acknowledgment handle with a first-settle guard: exactly one
/// terminal transition happens per message, later calls are no-ops.
#[derive(Clone)]
pub struct DeliveryHandle {
    inner: Arc<DeliveryInner>,
}

struct DeliveryInner {
    state: AtomicU8,
    acker: Arc<dyn MessageAck>,
}

impl DeliveryHandle {
    pub(crate) fn new(acker: Arc<dyn MessageAck>) -> Self {
        Self {
            inner: Arc::new(DeliveryInner {
                state: AtomicU8::new(PENDING),
                acker,
            }),
        }
    }

    /// First-settle guard: true when the caller won the transition out of
    /// the pending state and is responsible for finishing it.
    pub(crate) fn settle(&self) -> bool {
        self.inner
            .state
            .compare_exchange(PENDING, SETTLING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) async fn finish_ack(&self) -> Result<()> {
        self.inner.state.store(ACKNOWLEDGED, Ordering::SeqCst);
        self.inner.acker.ack().await
    }

    pub(crate) async fn finish_reject(&self, requeue: bool) -> Result<()> {
        self.inner.state.store(REJECTED, Ordering::SeqCst);
        self.inner.acker.reject(requeue).await
    }

    /// Acknowledge the delivery. Idempotent: only the first settle call on
    /// this handle has effect.
    pub async fn acknowledge(&self) -> Result<()> {
        if !self.settle() {
            return Ok(());
        }
        self.finish_ack().await
    }

    /// Reject the delivery at the broker level. Idempotent like
    /// [`acknowledge`](Self::acknowledge).
    pub async fn reject(&self, requeue: bool) -> Result<()> {
        if !self.settle() {
            return Ok(());
        }
        self.finish_reject(requeue).await
    }

    pub fn is_pending(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) == PENDING
    }

    pub fn is_acknowledged(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) == ACKNOWLEDGED
    }

    pub fn is_rejected(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) == REJECTED
    }
}

impl fmt::Debug for DeliveryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.state.load(Ordering::SeqCst) {
            PENDING => "pending",
            SETTLING => "settling",
            ACKNOWLEDGED => "acknowledged",
            _ => "rejected",
        };
        write!(f, "DeliveryHandle({})", state)
    }
}

struct DeferredWrite {
    payload: Vec<u8>,
    suffix: Option<String>,
    override_queue: Option<String>,
    sent: oneshot::Sender<Result<()>>,
}

enum ClientCommand {
    Write(DeferredWrite),
    End { done: oneshot::Sender<()> },
}

/// Bidirectional client over one reconnecting connection: one read side and
/// one write side sharing a topic exchange.
#[derive(Clone)]
pub struct JobQueueClient {
    cmd_tx: mpsc::UnboundedSender<ClientCommand>,
    options: Arc<ClientOptions>,
}

impl JobQueueClient {
    /// Validate the options, open the connection and start the client task.
    pub fn connect(
        transport: Arc<dyn Transport>,
        options: ClientOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>)> {
        options.validate()?;
        let options = Arc::new(options);
        let (conn, conn_events) =
            ReconnectingConnection::open(transport, ConnectionOptions::from(options.as_ref()));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let actor = ClientActor {
            options: options.clone(),
            conn,
            conn_events,
            cmd_rx,
            event_tx,
            deliveries: None,
            ready: false,
            deferred: VecDeque::new(),
        };
        tokio::spawn(actor.run());
        Ok((Self { cmd_tx, options }, event_rx))
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Publish `data` to `{override_queue || write_queue}[.suffix]` as a
    /// persistent message. Resolves once the publish was issued; before
    /// readiness the call is deferred, not dropped.
    pub async fn write<T: Serialize>(
        &self,
        data: &T,
        suffix: Option<&str>,
        override_queue: Option<&str>,
    ) -> Result<()> {
        let payload =
            serde_json::to_vec(data).map_err(|e| Error::SerializationError(e.to_string()))?;
        let (sent_tx, sent_rx) = oneshot::channel();
        self.cmd_tx
            .send(ClientCommand::Write(DeferredWrite {
                payload,
                suffix: suffix.map(str::to_string),
                override_queue: override_queue.map(str::to_string),
                sent: sent_tx,
            }))
            .map_err(|_| Error::ClosedError)?;
        sent_rx.await.map_err(|_| Error::ClosedError)?
    }

    /// Close the underlying connection; resolves once closure completes.
    pub async fn end(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(ClientCommand::End { done: done_tx })
            .is_err()
        {
            return Ok(());
        }
        let _ = done_rx.await;
        Ok(())
    }
}

enum Step {
    Conn(Option<ConnectionEvent>),
    Cmd(Option<ClientCommand>),
    Delivery(Option<RawDelivery>),
}

struct ClientActor {
    options: Arc<ClientOptions>,
    conn: ReconnectingConnection,
    conn_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    cmd_rx: mpsc::UnboundedReceiver<ClientCommand>,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
    deliveries: Option<mpsc::UnboundedReceiver<RawDelivery>>,
    ready: bool,
    deferred: VecDeque<DeferredWrite>,
}

impl ClientActor {
    async fn run(mut self) {
        loop {
            let step = {
                let conn_events = &mut self.conn_events;
                let cmd_rx = &mut self.cmd_rx;
                let deliveries = &mut self.deliveries;
                tokio::select! {
                    ev = conn_events.recv() => Step::Conn(ev),
                    cmd = cmd_rx.recv() => Step::Cmd(cmd),
                    delivery = async {
                        match deliveries {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => Step::Delivery(delivery),
                }
            };

            match step {
                Step::Conn(Some(ConnectionEvent::Connected(conn))) => {
                    match self.setup(conn.as_ref()).await {
                        Ok(rx) => {
                            self.deliveries = Some(rx);
                            if !self.ready {
                                self.ready = true;
                                let _ = self.event_tx.send(ClientEvent::Ready);
                                self.drain_deferred().await;
                            }
                        }
                        Err(err) => {
                            // The connection usually died mid-setup; the
                            // reconnect loop will hand over a fresh session.
                            warn!("Queue topology setup failed: {}", err);
                        }
                    }
                }
                Step::Conn(Some(ConnectionEvent::Disconnected)) => {
                    self.deliveries = None;
                }
                Step::Conn(Some(ConnectionEvent::Failed(err))) => {
                    self.deliveries = None;
                    let _ = self.event_tx.send(ClientEvent::Error(err));
                }
                Step::Conn(None) => return,
                Step::Cmd(Some(ClientCommand::Write(write))) => {
                    if self.ready {
                        self.forward_write(write).await;
                    } else {
                        self.deferred.push_back(write);
                    }
                }
                Step::Cmd(Some(ClientCommand::End { done })) => {
                    let _ = self.conn.close().await;
                    let _ = done.send(());
                    return;
                }
                Step::Cmd(None) => {
                    let _ = self.conn.close().await;
                    return;
                }
                Step::Delivery(Some(raw)) => self.handle_delivery(raw).await,
                Step::Delivery(None) => {
                    self.deliveries = None;
                }
            }
        }
    }

    /// Per-session topology: durable topic exchange, durable read queue,
    /// binding, subscription with the configured prefetch.
    async fn setup(
        &self,
        conn: &dyn BrokerConnection,
    ) -> Result<mpsc::UnboundedReceiver<RawDelivery>> {
        conn.declare_exchange(&self.options.exchange).await?;
        let queue = self.options.read_queue_name();
        conn.declare_queue(&queue).await?;
        conn.bind_queue(&queue, &self.options.exchange, &self.options.read_pattern())
            .await?;
        let rx = conn.consume(&queue, self.options.read_size).await?;
        debug!(
            "Subscribed to queue {} (prefetch {})",
            queue, self.options.read_size
        );
        Ok(rx)
    }

    async fn drain_deferred(&mut self) {
        while let Some(write) = self.deferred.pop_front() {
            self.forward_write(write).await;
        }
    }

    async fn forward_write(&self, write: DeferredWrite) {
        let base = write
            .override_queue
            .as_deref()
            .unwrap_or(&self.options.write_queue);
        let route = match &write.suffix {
            Some(suffix) => format!("{}.{}", base, suffix),
            None => base.to_string(),
        };
        let result = self
            .conn
            .publish(&self.options.exchange, &route, write.payload)
            .await;
        let _ = write.sent.send(result);
    }

    async fn handle_delivery(&self, raw: RawDelivery) {
        debug!("Received a message");
        match serde_json::from_slice::<Value>(&raw.payload) {
            Ok(payload) => {
                let _ = self.event_tx.send(ClientEvent::Read(IncomingMessage {
                    payload,
                    routing_key: raw.routing_key,
                    delivery: DeliveryHandle::new(raw.acker),
                }));
            }
            Err(err) => {
                error!("Failed to decode message payload: {}", err);
                let handle = DeliveryHandle::new(raw.acker);
                if let Err(reject_err) = handle.reject(false).await {
                    warn!("Failed to reject malformed message: {}", reject_err);
                }
            }
        }
    }
}
