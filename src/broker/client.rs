//! Broker connection/channel lifecycle.
//!
//! One `BrokerClient` per process, injected into every producer and
//! consumer. The connection and channel are shared: all callers go through
//! `channel()`, which serializes connection establishment so concurrent
//! callers await the same in-flight attempt instead of opening duplicates.

use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use futures::StreamExt;
use lapin::{
    options::{BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{BrokerError, DeliveryHandler, JobPublisher, Result, Topology};
use crate::config::BrokerConfig;
use crate::envelope::Envelope;

/// Options applied to a single publish.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Per-message TTL in milliseconds (the `expiration` property).
    pub expiration_ms: Option<u64>,
    /// Extra message headers.
    pub headers: Option<FieldTable>,
}

/// Snapshot of a queue's depth, from a passive declare.
#[derive(Debug, Clone)]
pub struct QueueInfo {
    pub queue: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

#[derive(Default)]
struct SharedState {
    connection: Option<Connection>,
    channel: Option<Channel>,
}

/// Shared AMQP connection, channel, and topology owner.
pub struct BrokerClient {
    config: BrokerConfig,
    topology: Topology,
    state: Mutex<SharedState>,
}

impl BrokerClient {
    /// Create a client without connecting. The first `channel()` call (or
    /// any publish/consume) establishes the connection.
    pub fn new(config: BrokerConfig) -> Self {
        let topology = Topology::from_config(&config);
        Self {
            config,
            topology,
            state: Mutex::new(SharedState::default()),
        }
    }

    /// Create a client and connect eagerly.
    ///
    /// Exhausting the connect retry budget is fatal; callers should abort
    /// service startup on error.
    pub async fn open(config: BrokerConfig) -> Result<Arc<Self>> {
        let client = Arc::new(Self::new(config));
        client.channel().await?;
        Ok(client)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// The shared channel, lazily established.
    ///
    /// Connection loss is detected here: a dead channel is dropped together
    /// with its connection, and the caller that noticed triggers a fresh
    /// connect-with-retry while later callers wait on the same lock.
    pub async fn channel(&self) -> Result<Channel> {
        let mut state = self.state.lock().await;
        if let Some(channel) = &state.channel {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
            warn!("broker channel lost, reconnecting");
        }
        state.connection = None;
        state.channel = None;

        let (connection, channel) = self.connect_with_retry().await?;
        state.connection = Some(connection);
        state.channel = Some(channel.clone());
        Ok(channel)
    }

    async fn connect_with_retry(&self) -> Result<(Connection, Channel)> {
        let attempts = self.config.connect_attempts;
        let mut backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.config.connect_min_delay_ms))
            .with_max_delay(Duration::from_millis(self.config.connect_max_delay_ms))
            .build();

        for attempt in 1..=attempts {
            match self.try_connect().await {
                Ok(pair) => {
                    info!(url = %self.config.url, "broker connected, topology ready");
                    return Ok(pair);
                }
                Err(e) => {
                    warn!(
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "broker connect failed"
                    );
                    if attempt < attempts {
                        let delay = backoff
                            .next()
                            .unwrap_or(Duration::from_millis(self.config.connect_max_delay_ms));
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(BrokerError::ConnectExhausted { attempts })
    }

    async fn try_connect(&self) -> Result<(Connection, Channel)> {
        let connection = Connection::connect(&self.config.url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        connection.on_error(|e| error!(error = %e, "broker connection error"));

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        channel
            .basic_qos(self.config.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Topology(format!("set prefetch: {e}")))?;

        self.topology.apply(&channel).await?;
        Ok((connection, channel))
    }

    /// Publish a JSON payload, persistent, fire-and-forget.
    ///
    /// No retry at this layer: redelivery semantics belong to the envelope
    /// contract and the consumer's nack decision.
    pub async fn publish<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
        options: PublishOptions,
    ) -> Result<()> {
        let channel = self.channel().await?;
        let body = serde_json::to_vec(payload)?;

        let mut properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2);
        if let Some(expiration_ms) = options.expiration_ms {
            properties = properties.with_expiration(expiration_ms.to_string().into());
        }
        if let Some(headers) = options.headers {
            properties = properties.with_headers(headers);
        }

        channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
            .map_err(|e| BrokerError::Publish(format!("{exchange}/{routing_key}: {e}")))?;

        if self.blocked().await {
            warn!(exchange, routing_key, "publish backpressure");
        }
        debug!(exchange, routing_key, "published");
        Ok(())
    }

    /// Whether the broker has blocked the connection (flow control).
    async fn blocked(&self) -> bool {
        let state = self.state.lock().await;
        state
            .connection
            .as_ref()
            .map(|c| c.status().blocked())
            .unwrap_or(false)
    }

    /// Publish to the application exchange.
    pub async fn publish_app<T: Serialize>(&self, routing_key: &str, payload: &T) -> Result<()> {
        self.publish(
            &self.config.exchange_app,
            routing_key,
            payload,
            PublishOptions::default(),
        )
        .await
    }

    /// Publish to the inbound-provider exchange.
    pub async fn publish_provider<T: Serialize>(
        &self,
        routing_key: &str,
        payload: &T,
    ) -> Result<()> {
        self.publish(
            &self.config.exchange_provider,
            routing_key,
            payload,
            PublishOptions::default(),
        )
        .await
    }

    /// Register a consumer on a queue.
    ///
    /// Returns after the consumer is registered; deliveries are processed
    /// on a spawned task. Handler errors are logged and never tear the loop
    /// down. The handler owns ack/nack, so an unhandled delivery stays
    /// outstanding until the channel closes. The task re-registers itself
    /// after stream loss.
    pub async fn consume(
        self: Arc<Self>,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<()> {
        let mut consumer = self.register(queue).await?;
        info!(queue, "consumer registered");

        let client = self;
        let queue = queue.to_string();
        tokio::spawn(async move {
            loop {
                while let Some(delivery) = consumer.next().await {
                    match delivery {
                        Ok(delivery) => {
                            if let Err(e) = handler.handle(delivery).await {
                                error!(queue = %queue, error = %e, "consumer handler failed");
                            }
                        }
                        Err(e) => {
                            error!(queue = %queue, error = %e, "consumer delivery error");
                            break;
                        }
                    }
                }

                warn!(queue = %queue, "consumer stream ended, re-registering");
                match client.register(&queue).await {
                    Ok(next) => consumer = next,
                    Err(e) => {
                        error!(queue = %queue, error = %e, "consumer re-registration failed, stopping");
                        return;
                    }
                }
            }
        });

        Ok(())
    }

    async fn register(&self, queue: &str) -> Result<lapin::Consumer> {
        let channel = self.channel().await?;
        channel
            .basic_consume(
                queue,
                // Server-generated tag: multiple consumers share the channel.
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(format!("{queue}: {e}")))
    }

    /// Queue depth snapshot via passive declare.
    pub async fn queue_info(&self, queue: &str) -> Result<QueueInfo> {
        let channel = self.channel().await?;
        let state = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(format!("{queue}: {e}")))?;

        Ok(QueueInfo {
            queue: queue.to_string(),
            message_count: state.message_count(),
            consumer_count: state.consumer_count(),
        })
    }

    /// Close channel then connection, swallowing close errors, and reset
    /// shared state so a later `channel()` reconnects cleanly.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if let Some(channel) = state.channel.take() {
            if let Err(e) = channel.close(200, "shutdown").await {
                debug!(error = %e, "channel close failed");
            }
        }
        if let Some(connection) = state.connection.take() {
            if let Err(e) = connection.close(200, "shutdown").await {
                debug!(error = %e, "connection close failed");
            }
        }
        info!("broker shutdown complete");
    }
}

#[async_trait::async_trait]
impl JobPublisher for BrokerClient {
    async fn publish_job(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
        options: PublishOptions,
    ) -> Result<()> {
        self.publish(exchange, routing_key, envelope, options).await
    }
}
