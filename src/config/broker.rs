//! Broker (RabbitMQ) configuration.

use serde::Deserialize;

/// Connection, topology naming, and flow-control knobs.
///
/// The defaults form a complete local/dev topology; every name is
/// overridable for shared or multi-environment brokers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Maximum unacknowledged deliveries outstanding per channel.
    pub prefetch: u16,

    /// Application exchange (backend/worker traffic).
    pub exchange_app: String,
    /// Inbound-provider exchange (messaging-provider webhook ingress).
    pub exchange_provider: String,
    /// Dead-letter exchange.
    pub exchange_dlx: String,

    /// Inbound message queue.
    pub queue_inbound: String,
    /// Inbound media queue.
    pub queue_inbound_media: String,
    /// Outbound request queue.
    pub queue_outbound: String,
    /// Outbound retry queue (the 10s sleep leg of the retry ring).
    pub queue_outbound_retry: String,
    /// Terminal outbound dead-letter queue.
    pub queue_outbound_dlq: String,
    /// Socket-delivery queue, consumed by the realtime relay.
    pub queue_socket: String,
    /// Campaign follow-up queue, consumed by the follow-up worker.
    pub queue_followup: String,
    /// Follow-up delay queue (per-message TTL scheduling leg).
    pub queue_followup_delay: String,
    /// Flow-builder execution queue.
    pub queue_flow_execution: String,
    /// Webhook dispatch queue.
    pub queue_webhook_dispatch: String,

    /// Sleep before a nacked outbound job re-enters its queue.
    pub retry_ttl_ms: u32,
    /// Connection attempts before startup fails.
    pub connect_attempts: u32,
    /// Initial connect backoff delay.
    pub connect_min_delay_ms: u64,
    /// Connect backoff ceiling.
    pub connect_max_delay_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672/%2f".to_string(),
            prefetch: 20,
            exchange_app: "livechat.app".to_string(),
            exchange_provider: "livechat.provider".to_string(),
            exchange_dlx: "livechat.dlx".to_string(),
            queue_inbound: "q.inbound.message".to_string(),
            queue_inbound_media: "q.inbound.media".to_string(),
            queue_outbound: "q.outbound.request".to_string(),
            queue_outbound_retry: "q.outbound.retry.10s".to_string(),
            queue_outbound_dlq: "q.outbound.dlq".to_string(),
            queue_socket: "q.socket.livechat".to_string(),
            queue_followup: "q.campaign.followup".to_string(),
            queue_followup_delay: "q.campaign.followup.delay".to_string(),
            queue_flow_execution: "q.flow.execution".to_string(),
            queue_webhook_dispatch: "q.webhook.dispatch".to_string(),
            retry_ttl_ms: 10_000,
            connect_attempts: 10,
            connect_min_delay_ms: 1_000,
            connect_max_delay_ms: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_config_default() {
        let config = BrokerConfig::default();
        assert_eq!(config.prefetch, 20);
        assert_eq!(config.retry_ttl_ms, 10_000);
        assert_eq!(config.connect_attempts, 10);
        assert_eq!(config.exchange_dlx, "livechat.dlx");
        assert_eq!(config.queue_outbound_retry, "q.outbound.retry.10s");
    }
}
