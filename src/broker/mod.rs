//! Broker topology and publish/consume primitives.
//!
//! This module contains:
//! - `BrokerClient`: shared connection/channel lifecycle, publish, consume
//! - `Topology`: exchange/queue/binding declarations, including the
//!   dead-letter and delayed-retry routing
//! - `RetryPolicy`: attempt budget helpers for the retry ring
//! - `MockJobPublisher`: in-memory publisher for tests

mod client;
pub mod mock;
mod retry;
mod topology;

pub use client::{BrokerClient, PublishOptions, QueueInfo};
pub use retry::{attempt_from_properties, effective_attempt, RetryDecision, RetryPolicy};
pub use topology::{
    Binding, DeadLetter, QueueSpec, Topology, RK_FLOW_EXECUTION, RK_FOLLOWUP_DELAY,
    RK_INBOUND_MEDIA, RK_INBOUND_MESSAGE, RK_OUTBOUND_DLQ, RK_OUTBOUND_REQUEST, RK_OUTBOUND_RETRY,
    RK_SOCKET_PATTERN, RK_WEBHOOK_DISPATCH,
};

use async_trait::async_trait;
use futures::future::BoxFuture;
use lapin::message::Delivery;

use crate::envelope::Envelope;

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors a consumer handler may surface; logged, never fatal to the loop.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur during broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Connection failed after {attempts} attempts")]
    ConnectExhausted { attempts: u32 },

    #[error("Topology setup failed: {0}")]
    Topology(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Handler for deliveries from a queue.
///
/// The handler owns the ack/nack decision: the consumer loop never
/// acknowledges on its behalf, so each consumer controls its own retry
/// versus drop semantics.
pub trait DeliveryHandler: Send + Sync {
    /// Process a single delivery.
    fn handle(&self, delivery: Delivery) -> BoxFuture<'static, std::result::Result<(), HandlerError>>;
}

/// Publishing seam for producers that should be testable without a broker.
///
/// Implementations:
/// - `BrokerClient`: the real thing
/// - `MockJobPublisher`: records published jobs for inspection
#[async_trait]
pub trait JobPublisher: Send + Sync {
    /// Publish a job envelope to an exchange under a routing key.
    async fn publish_job(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
        options: PublishOptions,
    ) -> Result<()>;
}
