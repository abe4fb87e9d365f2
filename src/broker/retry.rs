//! Retry ring policy helpers.
//!
//! The topology provides the rail (nack → DLX → retry queue → TTL expiry →
//! primary queue); the attempt budget is policy, owned by each consumer via
//! the envelope's counter. These helpers implement the common shape: bound
//! the attempts, then route exhausted jobs to the terminal dead-letter
//! queue.

use lapin::types::{AMQPValue, FieldTable};
use lapin::BasicProperties;
use serde_json::Value;

use super::client::{BrokerClient, PublishOptions};
use super::topology::{RK_OUTBOUND_DLQ, RK_OUTBOUND_RETRY};
use super::Result;
use crate::envelope::Envelope;

/// Attempt budget for a consumer that opts into the retry ring.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

/// Fate of a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-publish into the retry ring with the attempt bumped.
    Retry,
    /// Attempt budget exhausted; route to the terminal queue.
    DeadLetter,
}

impl RetryPolicy {
    /// Decide the fate of a failed delivery currently at `attempt`.
    pub fn decide(&self, attempt: u32) -> RetryDecision {
        if attempt + 1 <= self.max_attempts {
            RetryDecision::Retry
        } else {
            RetryDecision::DeadLetter
        }
    }
}

/// Attempt counter from message headers, 0 when absent or untyped.
pub fn attempt_from_properties(properties: &BasicProperties) -> u32 {
    properties
        .headers()
        .as_ref()
        .and_then(|headers| headers.inner().get("attempt"))
        .and_then(|value| match value {
            AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
            AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
            AMQPValue::ShortShortInt(n) => u32::try_from(*n).ok(),
            AMQPValue::ShortInt(n) => u32::try_from(*n).ok(),
            _ => None,
        })
        .unwrap_or(0)
}

/// Effective attempt for a delivery.
///
/// Producers mirror the counter into the `attempt` header; some only set
/// the body field. Trust whichever is larger.
pub fn effective_attempt(properties: &BasicProperties, envelope: &Envelope) -> u32 {
    attempt_from_properties(properties).max(envelope.attempt)
}

impl BrokerClient {
    /// Re-publish a failed job into the retry ring with the attempt bumped
    /// in both body and header.
    pub async fn send_to_retry(&self, envelope: &Envelope) -> Result<()> {
        let next = envelope.next_attempt();
        let mut headers = FieldTable::default();
        headers.insert(
            "attempt".into(),
            AMQPValue::LongLongInt(i64::from(next.attempt)),
        );
        self.publish(
            &self.config().exchange_dlx,
            RK_OUTBOUND_RETRY,
            &next,
            PublishOptions {
                headers: Some(headers),
                ..Default::default()
            },
        )
        .await
    }

    /// Route a job to the terminal dead-letter queue with the failure
    /// recorded in the body.
    pub async fn send_to_dead_letter(&self, envelope: &Envelope, error: &str) -> Result<()> {
        let mut dead = envelope.clone();
        dead.payload
            .insert("error".to_string(), Value::String(error.to_string()));
        self.publish(
            &self.config().exchange_dlx,
            RK_OUTBOUND_DLQ,
            &dead,
            PublishOptions::default(),
        )
        .await
    }
}
