//! Reconnecting wrapper around a broker connection.
//!
//! Send-style commands issued while the connection is down are buffered in
//! FIFO order and replayed exactly once after a successful reconnect, so a
//! caller never observes a difference between a live publish and a buffered
//! one. Reconnection is bounded: after `max_retries` failed attempts the
//! wrapper emits a terminal [`Error::ReconnectionFailed`] and must be treated
//! as dead. An explicit close during a reconnect episode abandons the loop,
//! and with it any buffered commands.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;

use crate::config::{BrokerOptions, ClientOptions};
use crate::transport::{BrokerConnection, Transport};
use crate::{Error, Result};

/// Connection-level slice of the client options.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
    pub max_retries: u32,
    pub broker: BrokerOptions,
}

impl From<&ClientOptions> for ConnectionOptions {
    fn from(options: &ClientOptions) -> Self {
        Self {
            auto_reconnect: options.auto_reconnect,
            reconnect_delay: options.reconnect_delay,
            max_retries: options.max_reconnect_retries,
            broker: options.broker.clone(),
        }
    }
}

/// Lifecycle notifications from the connection actor.
pub enum ConnectionEvent {
    /// A connection (initial or replacement) is live. Carries the session
    /// handle so topology can be redone per connection.
    Connected(Arc<dyn BrokerConnection>),
    /// The connection dropped unexpectedly; a reconnect may follow.
    Disconnected,
    /// Terminal failure. No buffered command will ever be delivered.
    Failed(Error),
}

impl fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::Connected(_) => write!(f, "Connected"),
            ConnectionEvent::Disconnected => write!(f, "Disconnected"),
            ConnectionEvent::Failed(err) => write!(f, "Failed({})", err),
        }
    }
}

struct PendingPublish {
    exchange: String,
    routing_key: String,
    payload: Vec<u8>,
    sent: Option<oneshot::Sender<()>>,
}

impl PendingPublish {
    fn notify_sent(&mut self) {
        if let Some(tx) = self.sent.take() {
            let _ = tx.send(());
        }
    }
}

enum Command {
    Publish(PendingPublish),
    Close { done: oneshot::Sender<()> },
}

/// Handle to a broker connection that survives drops by reconnecting.
#[derive(Clone)]
pub struct ReconnectingConnection {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl ReconnectingConnection {
    /// Open the underlying connection immediately and return the handle
    /// together with its lifecycle event stream.
    pub fn open(
        transport: Arc<dyn Transport>,
        options: ConnectionOptions,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let actor = Actor {
            transport,
            options,
            cmd_rx,
            event_tx,
            pending: VecDeque::new(),
        };
        tokio::spawn(actor.run());
        (Self { cmd_tx }, event_rx)
    }

    /// Publish a message. Resolves once the command has been issued; while
    /// disconnected the command is buffered and this resolves immediately.
    pub async fn publish(&self, exchange: &str, routing_key: &str, payload: Vec<u8>) -> Result<()> {
        let (sent_tx, sent_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Publish(PendingPublish {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                payload,
                sent: Some(sent_tx),
            }))
            .map_err(|_| Error::ClosedError)?;
        sent_rx.await.map_err(|_| Error::ClosedError)
    }

    /// Close the connection; resolves once closure completes. Cancels any
    /// in-progress reconnect, abandoning buffered commands.
    pub async fn close(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Close { done: done_tx }).is_err() {
            return Ok(());
        }
        let _ = done_rx.await;
        Ok(())
    }
}

enum SessionEnd {
    Dropped(String),
    CloseRequested(oneshot::Sender<()>),
    HandleGone,
}

enum RetryOutcome {
    Connected(Arc<dyn BrokerConnection>),
    Cancelled,
    Exhausted,
}

struct Actor {
    transport: Arc<dyn Transport>,
    options: ConnectionOptions,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    pending: VecDeque<PendingPublish>,
}

impl Actor {
    async fn run(mut self) {
        let mut next: Option<Arc<dyn BrokerConnection>> = None;
        loop {
            let conn = match next.take() {
                Some(conn) => conn,
                None => match self.transport.connect(&self.options.broker).await {
                    Ok(conn) => Arc::from(conn),
                    Err(err) => {
                        warn!("Broker connection failed: {}", err);
                        if !self.options.auto_reconnect {
                            self.fail(err).await;
                            return;
                        }
                        match self.retry().await {
                            RetryOutcome::Connected(conn) => conn,
                            RetryOutcome::Cancelled => return,
                            RetryOutcome::Exhausted => {
                                self.fail(Error::ReconnectionFailed).await;
                                return;
                            }
                        }
                    }
                },
            };

            let _ = self.event_tx.send(ConnectionEvent::Connected(conn.clone()));
            self.flush(&conn).await;

            match self.session(&conn).await {
                SessionEnd::CloseRequested(done) => {
                    if let Err(err) = conn.close().await {
                        debug!("Error while closing connection: {}", err);
                    }
                    let _ = done.send(());
                    return;
                }
                SessionEnd::HandleGone => {
                    let _ = conn.close().await;
                    return;
                }
                SessionEnd::Dropped(reason) => {
                    warn!("Broker connection lost: {}", reason);
                    let _ = self.event_tx.send(ConnectionEvent::Disconnected);
                    if !self.options.auto_reconnect {
                        self.fail(Error::ConnectionError(reason)).await;
                        return;
                    }
                    match self.retry().await {
                        RetryOutcome::Connected(conn) => next = Some(conn),
                        RetryOutcome::Cancelled => return,
                        RetryOutcome::Exhausted => {
                            self.fail(Error::ReconnectionFailed).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Serve commands against a live connection until it drops or the
    /// caller closes.
    async fn session(&mut self, conn: &Arc<dyn BrokerConnection>) -> SessionEnd {
        loop {
            let cmd = tokio::select! {
                reason = conn.closed() => return SessionEnd::Dropped(reason),
                cmd = self.cmd_rx.recv() => cmd,
            };
            match cmd {
                Some(Command::Publish(mut publish)) => {
                    match conn
                        .publish(&publish.exchange, &publish.routing_key, &publish.payload)
                        .await
                    {
                        Ok(()) => publish.notify_sent(),
                        Err(err) => {
                            // The connection is going down; keep the command
                            // for the next session.
                            warn!("Publish failed, buffering until reconnect: {}", err);
                            publish.notify_sent();
                            self.pending.push_back(publish);
                        }
                    }
                }
                Some(Command::Close { done }) => return SessionEnd::CloseRequested(done),
                None => return SessionEnd::HandleGone,
            }
        }
    }

    /// Bounded reconnect loop: one fixed delay before each attempt, one
    /// attempt per unit of budget.
    async fn retry(&mut self) -> RetryOutcome {
        let mut remaining = self.options.max_retries;
        info!(
            "Reconnecting to broker (max {} attempts, {:?} between attempts)",
            remaining, self.options.reconnect_delay
        );
        loop {
            if remaining == 0 {
                return RetryOutcome::Exhausted;
            }
            remaining -= 1;
            if !self.sleep_buffering(self.options.reconnect_delay).await {
                return RetryOutcome::Cancelled;
            }
            match self.transport.connect(&self.options.broker).await {
                Ok(conn) => {
                    info!("Reconnected to broker");
                    return RetryOutcome::Connected(Arc::from(conn));
                }
                Err(err) => warn!(
                    "Reconnect attempt failed ({} left): {}",
                    remaining, err
                ),
            }
        }
    }

    /// Sleep while buffering publishes. Returns false when an explicit close
    /// cancelled the wait; buffered data is abandoned in that case.
    async fn sleep_buffering(&mut self, delay: Duration) -> bool {
        let timer = sleep(delay);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                _ = &mut timer => return true,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Publish(mut publish)) => {
                        publish.notify_sent();
                        self.pending.push_back(publish);
                    }
                    Some(Command::Close { done }) => {
                        debug!("Close requested while reconnecting, abandoning reconnect");
                        let _ = done.send(());
                        return false;
                    }
                    None => return false,
                },
            }
        }
    }

    /// Replay buffered commands in FIFO order, exactly once each.
    async fn flush(&mut self, conn: &Arc<dyn BrokerConnection>) {
        if self.pending.is_empty() {
            return;
        }
        debug!("Flushing {} buffered commands", self.pending.len());
        while let Some(publish) = self.pending.pop_front() {
            if let Err(err) = conn
                .publish(&publish.exchange, &publish.routing_key, &publish.payload)
                .await
            {
                warn!(
                    "Flush interrupted, keeping {} buffered commands: {}",
                    self.pending.len() + 1,
                    err
                );
                self.pending.push_front(publish);
                return;
            }
        }
    }

    /// Terminal state: surface the error, then serve only close requests.
    async fn fail(&mut self, err: Error) {
        error!("Connection entered failed state: {}", err);
        let _ = self.event_tx.send(ConnectionEvent::Failed(err));
        self.pending.clear();
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Publish(publish) => drop(publish),
                Command::Close { done } => {
                    let _ = done.send(());
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::spin;
    use crate::transport::fake::FakeTransport;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn options() -> ConnectionOptions {
        ConnectionOptions {
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(10),
            max_retries: 3,
            broker: BrokerOptions::default(),
        }
    }

    fn expect_connected(events: &mut UnboundedReceiver<ConnectionEvent>) {
        match events.try_recv() {
            Ok(ConnectionEvent::Connected(_)) => {}
            other => panic!("expected Connected event, got {:?}", other.ok()),
        }
    }

    fn expect_disconnected(events: &mut UnboundedReceiver<ConnectionEvent>) {
        match events.try_recv() {
            Ok(ConnectionEvent::Disconnected) => {}
            other => panic!("expected Disconnected event, got {:?}", other.ok()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connects_immediately_and_publishes_live() {
        let transport = Arc::new(FakeTransport::new());
        let (conn, mut events) = ReconnectingConnection::open(transport.clone(), options());
        spin().await;

        assert_eq!(transport.connect_count(), 1);
        expect_connected(&mut events);

        conn.publish("jobs-exchange", "jobs.fake", b"payload".to_vec())
            .await
            .unwrap();
        spin().await;

        let published = transport.last_connection().published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "jobs-exchange");
        assert_eq!(published[0].1, "jobs.fake");
    }

    #[tokio::test(start_paused = true)]
    async fn buffered_publishes_flush_in_order_after_reconnect() {
        let transport = Arc::new(FakeTransport::new());
        let (conn, mut events) = ReconnectingConnection::open(transport.clone(), options());
        spin().await;
        expect_connected(&mut events);

        let first = transport.last_connection();
        first.drop_connection("broker restart");
        spin().await;
        expect_disconnected(&mut events);

        for payload in [b"a".to_vec(), b"b".to_vec(), b"c".to_vec()] {
            conn.publish("ex", "route", payload).await.unwrap();
        }
        assert!(first.published().is_empty());

        // Let the reconnect timer fire.
        sleep(Duration::from_secs(11)).await;
        spin().await;

        assert_eq!(transport.connection_count(), 2);
        expect_connected(&mut events);
        let replayed: Vec<Vec<u8>> = transport
            .last_connection()
            .published()
            .into_iter()
            .map(|(_, _, payload)| payload)
            .collect();
        assert_eq!(replayed, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_terminal_error() {
        let transport = Arc::new(FakeTransport::new());
        let (conn, mut events) = ReconnectingConnection::open(transport.clone(), options());
        spin().await;
        expect_connected(&mut events);

        transport.fail_next_connects(10);
        transport.last_connection().drop_connection("gone");
        sleep(Duration::from_secs(60)).await;
        spin().await;

        // Initial connect plus max_retries failed attempts.
        assert_eq!(transport.connect_count(), 4);
        expect_disconnected(&mut events);
        match events.try_recv() {
            Ok(ConnectionEvent::Failed(Error::ReconnectionFailed)) => {}
            other => panic!("expected Failed event, got {:?}", other.ok()),
        }

        // The connection is dead: publishes are refused, close still works.
        assert!(conn.publish("ex", "route", b"x".to_vec()).await.is_err());
        conn.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_success_cancels_further_retries() {
        let transport = Arc::new(FakeTransport::new());
        let (_conn, mut events) = ReconnectingConnection::open(transport.clone(), options());
        spin().await;
        expect_connected(&mut events);

        transport.fail_next_connects(2);
        transport.last_connection().drop_connection("gone");
        sleep(Duration::from_secs(35)).await;
        spin().await;

        // Two failed attempts, then success on the third.
        assert_eq!(transport.connect_count(), 4);
        assert_eq!(transport.connection_count(), 2);
        expect_disconnected(&mut events);
        expect_connected(&mut events);

        sleep(Duration::from_secs(60)).await;
        spin().await;
        assert_eq!(transport.connect_count(), 4);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn close_during_reconnect_cancels_silently() {
        let transport = Arc::new(FakeTransport::new());
        let (conn, mut events) = ReconnectingConnection::open(transport.clone(), options());
        spin().await;
        expect_connected(&mut events);

        transport.fail_next_connects(10);
        transport.last_connection().drop_connection("gone");
        spin().await;
        expect_disconnected(&mut events);

        // Buffered during the reconnect window, then abandoned by close.
        conn.publish("ex", "route", b"lost".to_vec()).await.unwrap();
        conn.close().await.unwrap();

        sleep(Duration::from_secs(120)).await;
        spin().await;
        assert_eq!(transport.connect_count(), 1);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_auto_reconnect_fails_on_first_drop() {
        let transport = Arc::new(FakeTransport::new());
        let mut opts = options();
        opts.auto_reconnect = false;
        let (_conn, mut events) = ReconnectingConnection::open(transport.clone(), opts);
        spin().await;
        expect_connected(&mut events);

        transport.last_connection().drop_connection("gone");
        spin().await;

        expect_disconnected(&mut events);
        match events.try_recv() {
            Ok(ConnectionEvent::Failed(Error::ConnectionError(_))) => {}
            other => panic!("expected Failed event, got {:?}", other.ok()),
        }
        assert_eq!(transport.connect_count(), 1);
    }
}
