//! Broker abstraction boundary.
//!
//! The reliability layer only talks to the broker through these traits, so
//! it can be exercised against an in-memory fake as well as a live AMQP
//! server.

pub mod amqp;
#[cfg(test)]
pub(crate) mod fake;

pub use amqp::AmqpTransport;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::BrokerOptions;
use crate::Result;

/// Connection factory. One call to [`Transport::connect`] yields one live
/// broker connection; the reconnect layer calls it again after each drop.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, options: &BrokerOptions) -> Result<Box<dyn BrokerConnection>>;
}

/// A live broker connection.
///
/// Exchanges are topic exchanges, and all declared entities are durable and
/// not auto-deleted. Published messages are persistent.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn declare_exchange(&self, name: &str) -> Result<()>;

    async fn declare_queue(&self, name: &str) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()>;

    /// Subscribe with explicit acknowledgment and the given prefetch count.
    /// Deliveries arrive on the returned channel until the connection drops.
    async fn consume(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<mpsc::UnboundedReceiver<RawDelivery>>;

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Resolves with the failure reason when the connection drops
    /// unexpectedly. Never resolves for an intentional [`close`](Self::close).
    async fn closed(&self) -> String;
}

/// One consumed message, not yet acknowledged.
pub struct RawDelivery {
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub acker: Arc<dyn MessageAck>,
}

/// Acknowledgment surface bound to a specific delivery.
#[async_trait]
pub trait MessageAck: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn reject(&self, requeue: bool) -> Result<()>;
}
