//! Mock job publisher for testing producers without a broker.

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::client::PublishOptions;
use super::{BrokerError, JobPublisher, Result};
use crate::envelope::Envelope;

/// A job captured by the mock publisher.
#[derive(Debug, Clone)]
pub struct PublishedJob {
    pub exchange: String,
    pub routing_key: String,
    pub envelope: Envelope,
    pub options: PublishOptions,
}

/// Mock publisher that records published jobs.
#[derive(Default)]
pub struct MockJobPublisher {
    published: RwLock<Vec<PublishedJob>>,
    fail_on_publish: RwLock<bool>,
}

impl MockJobPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    pub async fn take_published(&self) -> Vec<PublishedJob> {
        std::mem::take(&mut *self.published.write().await)
    }
}

#[async_trait]
impl JobPublisher for MockJobPublisher {
    async fn publish_job(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
        options: PublishOptions,
    ) -> Result<()> {
        if *self.fail_on_publish.read().await {
            return Err(BrokerError::Publish("mock publish failure".to_string()));
        }
        self.published.write().await.push(PublishedJob {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            envelope: envelope.clone(),
            options,
        });
        Ok(())
    }
}
