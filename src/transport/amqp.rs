//! AMQP transport backed by lapin.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use log::{debug, warn};
use tokio::sync::{mpsc, watch};

use super::{BrokerConnection, MessageAck, RawDelivery, Transport};
use crate::config::BrokerOptions;
use crate::{Error, Result};

const PERSISTENT: u8 = 2;

/// Default [`Transport`] connecting to a RabbitMQ-compatible broker.
pub struct AmqpTransport;

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(&self, options: &BrokerOptions) -> Result<Box<dyn BrokerConnection>> {
        let connection = Connection::connect(&options.uri(), ConnectionProperties::default())
            .await
            .map_err(|e| Error::ConnectionError(e.to_string()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| Error::ConnectionError(e.to_string()))?;

        let (close_tx, close_rx) = watch::channel(None);
        connection.on_error(move |err| {
            let _ = close_tx.send(Some(err.to_string()));
        });

        debug!("Connected to broker at {}:{}", options.host, options.port);

        Ok(Box::new(AmqpConnection {
            connection,
            channel,
            closed: close_rx,
        }))
    }
}

struct AmqpConnection {
    connection: Connection,
    channel: Channel,
    closed: watch::Receiver<Option<String>>,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn declare_exchange(&self, name: &str) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::ConnectionError(e.to_string()))?;

        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> Result<()> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::ConnectionError(e.to_string()))?;

        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::ConnectionError(e.to_string()))?;

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<mpsc::UnboundedReceiver<RawDelivery>> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| Error::ConnectionError(e.to_string()))?;

        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::ConnectionError(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(attempt) = consumer.next().await {
                match attempt {
                    Ok(delivery) => {
                        let lapin::message::Delivery {
                            routing_key,
                            data,
                            acker,
                            ..
                        } = delivery;
                        let raw = RawDelivery {
                            routing_key: routing_key.as_str().to_string(),
                            payload: data,
                            acker: Arc::new(AmqpAcker { acker }),
                        };
                        if tx.send(raw).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Consumer stream error: {}", e);
                        break;
                    }
                }
            }
            debug!("Consumer stream ended");
        });

        Ok(rx)
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_delivery_mode(PERSISTENT),
            )
            .await
            .map_err(|e| Error::PublishError(e.to_string()))?
            .await
            .map_err(|e| Error::PublishError(e.to_string()))?;

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.connection
            .close(200, "OK")
            .await
            .map_err(|e| Error::ConnectionError(e.to_string()))?;

        Ok(())
    }

    async fn closed(&self) -> String {
        let mut closed = self.closed.clone();
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

struct AmqpAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl MessageAck for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(Error::from)
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(Error::from)
    }
}
