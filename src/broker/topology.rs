//! Exchange/queue/binding topology.
//!
//! Built once from configuration and declared against every new channel.
//! Re-declaration of identical definitions is a broker no-op, so applying
//! the topology is idempotent.
//!
//! The outbound path forms a delayed-retry ring: a nacked job dead-letters
//! to the DLX under `outbound.retry`, sleeps in the retry queue until its
//! TTL expires, then re-enters the application exchange under the same
//! routing key, which is already bound on the outbound queue.

use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable},
    Channel, ExchangeKind,
};

use super::{BrokerError, Result};
use crate::config::BrokerConfig;

/// Routing key for provider-ingested messages.
pub const RK_INBOUND_MESSAGE: &str = "inbound.message";
/// Routing key for inbound media fetch jobs.
pub const RK_INBOUND_MEDIA: &str = "inbound.media";
/// Routing key for outbound send requests.
pub const RK_OUTBOUND_REQUEST: &str = "outbound.request";
/// Routing key for the retry leg of the outbound ring.
pub const RK_OUTBOUND_RETRY: &str = "outbound.retry";
/// Routing key for terminal outbound failures.
pub const RK_OUTBOUND_DLQ: &str = "outbound.dlq";
/// Binding pattern for socket-delivery events.
pub const RK_SOCKET_PATTERN: &str = "socket.livechat.*";
/// Routing key for follow-up scheduling (per-message TTL leg).
pub const RK_FOLLOWUP_DELAY: &str = "campaign.followup.delay";
/// Routing key for flow-builder executions.
pub const RK_FLOW_EXECUTION: &str = "flow.execution";
/// Routing key for webhook dispatches.
pub const RK_WEBHOOK_DISPATCH: &str = "webhook.dispatch";

/// A queue-to-exchange binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub exchange: String,
    pub routing_key: String,
}

/// Dead-letter target for a queue.
///
/// Without a routing key override, a dead-lettered message keeps its
/// original routing key.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub exchange: String,
    pub routing_key: Option<String>,
}

/// One durable queue with its bindings and arguments.
#[derive(Debug, Clone)]
pub struct QueueSpec {
    pub name: String,
    pub bindings: Vec<Binding>,
    pub dead_letter: Option<DeadLetter>,
    /// Queue-level per-message TTL in milliseconds.
    pub message_ttl_ms: Option<u32>,
}

impl QueueSpec {
    fn arguments(&self) -> FieldTable {
        let mut args = FieldTable::default();
        if let Some(dead_letter) = &self.dead_letter {
            args.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(dead_letter.exchange.as_str().into()),
            );
            if let Some(routing_key) = &dead_letter.routing_key {
                args.insert(
                    "x-dead-letter-routing-key".into(),
                    AMQPValue::LongString(routing_key.as_str().into()),
                );
            }
        }
        if let Some(ttl) = self.message_ttl_ms {
            args.insert("x-message-ttl".into(), AMQPValue::LongInt(ttl as i32));
        }
        args
    }
}

/// The full exchange/queue/binding table.
#[derive(Debug, Clone)]
pub struct Topology {
    pub exchanges: Vec<String>,
    pub queues: Vec<QueueSpec>,
}

impl Topology {
    /// Build the topology from configuration.
    pub fn from_config(config: &BrokerConfig) -> Self {
        let app = config.exchange_app.clone();
        let provider = config.exchange_provider.clone();
        let dlx = config.exchange_dlx.clone();

        let bind = |exchange: &str, routing_key: &str| Binding {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };

        let queues = vec![
            // Provider -> app ingress.
            QueueSpec {
                name: config.queue_inbound.clone(),
                bindings: vec![bind(&provider, RK_INBOUND_MESSAGE)],
                dead_letter: Some(DeadLetter {
                    exchange: dlx.clone(),
                    routing_key: None,
                }),
                message_ttl_ms: None,
            },
            QueueSpec {
                name: config.queue_inbound_media.clone(),
                bindings: vec![bind(&app, RK_INBOUND_MEDIA)],
                dead_letter: Some(DeadLetter {
                    exchange: dlx.clone(),
                    routing_key: None,
                }),
                message_ttl_ms: None,
            },
            // Outbound requests: a nack routes to the DLX under
            // `outbound.retry`, landing in the retry queue below. The
            // second binding receives the job back after the sleep.
            QueueSpec {
                name: config.queue_outbound.clone(),
                bindings: vec![bind(&app, RK_OUTBOUND_REQUEST), bind(&app, RK_OUTBOUND_RETRY)],
                dead_letter: Some(DeadLetter {
                    exchange: dlx.clone(),
                    routing_key: Some(RK_OUTBOUND_RETRY.to_string()),
                }),
                message_ttl_ms: None,
            },
            // Retry sleep leg: expiry re-publishes to the app exchange with
            // the routing key unchanged, so the job re-enters the outbound
            // queue through its `outbound.retry` binding.
            QueueSpec {
                name: config.queue_outbound_retry.clone(),
                bindings: vec![bind(&dlx, RK_OUTBOUND_RETRY)],
                dead_letter: Some(DeadLetter {
                    exchange: app.clone(),
                    routing_key: None,
                }),
                message_ttl_ms: Some(config.retry_ttl_ms),
            },
            // Terminal failures; reached only when a consumer routes here
            // after exhausting its own attempt budget.
            QueueSpec {
                name: config.queue_outbound_dlq.clone(),
                bindings: vec![bind(&dlx, RK_OUTBOUND_DLQ)],
                dead_letter: None,
                message_ttl_ms: None,
            },
            // Worker -> realtime relay.
            QueueSpec {
                name: config.queue_socket.clone(),
                bindings: vec![bind(&app, RK_SOCKET_PATTERN)],
                dead_letter: Some(DeadLetter {
                    exchange: dlx.clone(),
                    routing_key: None,
                }),
                message_ttl_ms: None,
            },
            // Campaign reply signals, published directly to the queue.
            QueueSpec {
                name: config.queue_followup.clone(),
                bindings: vec![],
                dead_letter: None,
                message_ttl_ms: None,
            },
            // Follow-up scheduling leg: jobs are published here with a
            // per-message expiration; expiry forwards them to the outbound
            // queue as ordinary send requests.
            QueueSpec {
                name: config.queue_followup_delay.clone(),
                bindings: vec![bind(&dlx, RK_FOLLOWUP_DELAY)],
                dead_letter: Some(DeadLetter {
                    exchange: app.clone(),
                    routing_key: Some(RK_OUTBOUND_REQUEST.to_string()),
                }),
                message_ttl_ms: None,
            },
            QueueSpec {
                name: config.queue_flow_execution.clone(),
                bindings: vec![bind(&app, RK_FLOW_EXECUTION)],
                dead_letter: None,
                message_ttl_ms: None,
            },
            QueueSpec {
                name: config.queue_webhook_dispatch.clone(),
                bindings: vec![bind(&app, RK_WEBHOOK_DISPATCH)],
                dead_letter: Some(DeadLetter {
                    exchange: dlx.clone(),
                    routing_key: None,
                }),
                message_ttl_ms: None,
            },
        ];

        Self {
            exchanges: vec![app, provider, dlx],
            queues,
        }
    }

    /// Declare every exchange, queue, and binding on the channel.
    ///
    /// Failures abort startup: correct routing depends on the full table
    /// existing before any publish or consume.
    pub async fn apply(&self, channel: &Channel) -> Result<()> {
        for exchange in &self.exchanges {
            channel
                .exchange_declare(
                    exchange,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::Topology(format!("declare exchange {exchange}: {e}")))?;
        }

        for queue in &self.queues {
            channel
                .queue_declare(
                    &queue.name,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    queue.arguments(),
                )
                .await
                .map_err(|e| BrokerError::Topology(format!("declare queue {}: {e}", queue.name)))?;

            for binding in &queue.bindings {
                channel
                    .queue_bind(
                        &queue.name,
                        &binding.exchange,
                        &binding.routing_key,
                        QueueBindOptions::default(),
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|e| {
                        BrokerError::Topology(format!(
                            "bind {} to {}/{}: {e}",
                            queue.name, binding.exchange, binding.routing_key
                        ))
                    })?;
            }
        }

        Ok(())
    }

    /// Look up a queue spec by name.
    pub fn queue(&self, name: &str) -> Option<&QueueSpec> {
        self.queues.iter().find(|q| q.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology() -> (BrokerConfig, Topology) {
        let config = BrokerConfig::default();
        let topology = Topology::from_config(&config);
        (config, topology)
    }

    #[test]
    fn test_declares_three_exchanges() {
        let (config, topology) = topology();
        assert_eq!(topology.exchanges.len(), 3);
        assert!(topology.exchanges.contains(&config.exchange_app));
        assert!(topology.exchanges.contains(&config.exchange_provider));
        assert!(topology.exchanges.contains(&config.exchange_dlx));
    }

    #[test]
    fn test_retry_ring_routing_key_reenters_outbound_queue() {
        let (config, topology) = topology();
        let outbound = topology.queue(&config.queue_outbound).unwrap();
        let retry = topology.queue(&config.queue_outbound_retry).unwrap();

        // The retry queue receives what the outbound queue dead-letters...
        let dead_letter = outbound.dead_letter.as_ref().unwrap();
        assert_eq!(dead_letter.exchange, config.exchange_dlx);
        assert_eq!(dead_letter.routing_key.as_deref(), Some(RK_OUTBOUND_RETRY));
        assert!(retry
            .bindings
            .contains(&Binding {
                exchange: config.exchange_dlx.clone(),
                routing_key: RK_OUTBOUND_RETRY.to_string(),
            }));

        // ...and its expiry key must already be bound on the outbound queue,
        // so TTL expiry re-enters it without operator intervention.
        let expiry = retry.dead_letter.as_ref().unwrap();
        assert_eq!(expiry.exchange, config.exchange_app);
        assert!(expiry.routing_key.is_none());
        assert!(outbound
            .bindings
            .iter()
            .any(|b| b.exchange == config.exchange_app && b.routing_key == RK_OUTBOUND_RETRY));
    }

    #[test]
    fn test_retry_queue_has_sleep_ttl() {
        let (config, topology) = topology();
        let retry = topology.queue(&config.queue_outbound_retry).unwrap();
        assert_eq!(retry.message_ttl_ms, Some(10_000));
    }

    #[test]
    fn test_dead_letter_queue_is_terminal() {
        let (config, topology) = topology();
        let dlq = topology.queue(&config.queue_outbound_dlq).unwrap();
        assert!(dlq.dead_letter.is_none());
        assert_eq!(
            dlq.bindings,
            vec![Binding {
                exchange: config.exchange_dlx.clone(),
                routing_key: RK_OUTBOUND_DLQ.to_string(),
            }]
        );
    }

    #[test]
    fn test_followup_delay_expires_into_outbound_requests() {
        let (config, topology) = topology();
        let delay = topology.queue(&config.queue_followup_delay).unwrap();

        assert!(delay
            .bindings
            .contains(&Binding {
                exchange: config.exchange_dlx.clone(),
                routing_key: RK_FOLLOWUP_DELAY.to_string(),
            }));
        // No queue-level TTL: each job carries its own expiration.
        assert!(delay.message_ttl_ms.is_none());

        let expiry = delay.dead_letter.as_ref().unwrap();
        assert_eq!(expiry.exchange, config.exchange_app);
        assert_eq!(expiry.routing_key.as_deref(), Some(RK_OUTBOUND_REQUEST));

        let outbound = topology.queue(&config.queue_outbound).unwrap();
        assert!(outbound
            .bindings
            .iter()
            .any(|b| b.exchange == config.exchange_app && b.routing_key == RK_OUTBOUND_REQUEST));
    }

    #[test]
    fn test_followup_queue_is_direct() {
        let (config, topology) = topology();
        let followup = topology.queue(&config.queue_followup).unwrap();
        assert!(followup.bindings.is_empty());
    }

    #[test]
    fn test_nackable_queues_dead_letter_under_distinct_keys() {
        let (config, topology) = topology();

        // Queues that dead-letter without a routing key override keep their
        // original key; those keys must be distinct so dead letters stay
        // attributable per source queue.
        let mut preserved_keys: Vec<&str> = topology
            .queues
            .iter()
            .filter(|q| {
                q.dead_letter
                    .as_ref()
                    .is_some_and(|d| d.exchange == config.exchange_dlx && d.routing_key.is_none())
            })
            .flat_map(|q| q.bindings.iter().map(|b| b.routing_key.as_str()))
            .collect();
        let total = preserved_keys.len();
        preserved_keys.sort_unstable();
        preserved_keys.dedup();
        assert_eq!(preserved_keys.len(), total);
    }

    #[test]
    fn test_no_duplicate_bindings() {
        let (_, topology) = topology();
        for queue in &topology.queues {
            let mut seen = queue.bindings.clone();
            let total = seen.len();
            seen.dedup();
            assert_eq!(seen.len(), total, "duplicate binding on {}", queue.name);
        }
    }

    #[test]
    fn test_queue_arguments_encode_dead_letter_and_ttl() {
        let (config, topology) = topology();
        let retry = topology.queue(&config.queue_outbound_retry).unwrap();
        let args = retry.arguments();
        let inner = args.inner();
        assert!(inner.contains_key("x-dead-letter-exchange"));
        assert!(!inner.contains_key("x-dead-letter-routing-key"));
        assert!(inner.contains_key("x-message-ttl"));

        let outbound = topology.queue(&config.queue_outbound).unwrap();
        let inner = outbound.arguments();
        assert!(inner.inner().contains_key("x-dead-letter-routing-key"));
    }
}
