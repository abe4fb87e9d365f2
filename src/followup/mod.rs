//! Deferred campaign follow-ups.
//!
//! Consumes "customer replied" signals from the campaign follow-up queue
//! and decides the next action: hand the conversation to an AI agent, or
//! schedule the next scripted follow-up step.
//!
//! Step delays ride the broker's dead-letter ring: the send job is parked
//! on the follow-up delay queue with a per-message expiration, and expiry
//! forwards it to the outbound queue. The schedule survives process
//! restarts, unlike an in-process timer.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use lapin::message::Delivery;
use lapin::options::BasicAckOptions;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::broker::{
    BrokerClient, DeliveryHandler, HandlerError, JobPublisher, PublishOptions, RK_FOLLOWUP_DELAY,
};
use crate::config::BrokerConfig;
use crate::envelope::Envelope;

/// Result type for follow-up operations.
pub type Result<T> = std::result::Result<T, FollowupError>;

/// Errors that can occur while processing a reply signal.
#[derive(Debug, thiserror::Error)]
pub enum FollowupError {
    #[error("Campaign store error: {0}")]
    Store(String),

    #[error("Publish failed: {0}")]
    Publish(#[from] crate::broker::BrokerError),

    #[error("Invalid job: {0}")]
    InvalidJob(String),
}

/// Job type the worker reacts to.
pub const JOB_CHAT_INBOUND: &str = "chat_inbound";
/// Job published when a campaign hands off to an AI agent.
pub const JOB_AI_HANDOFF: &str = "ai.handoff";
/// Job published for a scripted follow-up send.
pub const JOB_MESSAGE_SEND: &str = "message.send";

/// Payload of a `chat_inbound` signal.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplySignal {
    #[serde(rename = "campaignId")]
    pub campaign_id: String,
    pub phone: String,
    #[serde(rename = "chatId", default)]
    pub chat_id: Option<String>,
    #[serde(rename = "companyId", default)]
    pub company_id: Option<String>,
}

/// A campaign's reply-handling configuration.
#[derive(Debug, Clone)]
pub struct CampaignFollowupConfig {
    /// Hand the conversation to an AI agent when the customer replies.
    pub ai_handoff_on_reply: bool,
    /// Send scripted follow-up steps when the customer replies.
    pub auto_followups_enabled: bool,
}

/// One scripted follow-up step.
#[derive(Debug, Clone)]
pub struct FollowupStep {
    pub id: String,
    pub template_id: String,
    pub delay_secs: u64,
    pub position: u32,
}

/// Campaign data seam; tenant modeling lives outside the backbone.
///
/// Implementations are expected to make `mark_recipient_responded`
/// idempotent, keyed by campaign + phone.
#[async_trait]
pub trait CampaignStore: Send + Sync {
    /// `None` when the campaign no longer exists.
    async fn followup_config(&self, campaign_id: &str) -> Result<Option<CampaignFollowupConfig>>;

    async fn mark_recipient_responded(&self, campaign_id: &str, phone: &str) -> Result<()>;

    /// Next pending step in position order for this recipient.
    async fn next_pending_step(
        &self,
        campaign_id: &str,
        phone: &str,
    ) -> Result<Option<FollowupStep>>;

    async fn template_text(&self, template_id: &str) -> Result<Option<String>>;
}

/// What the worker did with a reply signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowupOutcome {
    /// Campaign deleted after the signal was queued; discarded.
    CampaignGone,
    HandedOffToAgent,
    StepScheduled { step_id: String, delay_secs: u64 },
    /// Follow-ups enabled but the script is exhausted (or its template is
    /// missing).
    NothingPending,
    FollowupsDisabled,
}

/// The follow-up consumer.
#[derive(Clone)]
pub struct FollowupWorker {
    publisher: Arc<dyn JobPublisher>,
    store: Arc<dyn CampaignStore>,
    broker_config: BrokerConfig,
}

impl FollowupWorker {
    pub fn new(
        publisher: Arc<dyn JobPublisher>,
        store: Arc<dyn CampaignStore>,
        broker_config: BrokerConfig,
    ) -> Self {
        Self {
            publisher,
            store,
            broker_config,
        }
    }

    /// Register this worker on the campaign follow-up queue.
    pub async fn start(self, broker: &Arc<BrokerClient>) -> crate::broker::Result<()> {
        let queue = broker.config().queue_followup.clone();
        Arc::clone(broker).consume(&queue, Arc::new(self)).await
    }

    /// Process one reply signal.
    pub async fn process(&self, envelope: &Envelope) -> Result<FollowupOutcome> {
        if envelope.job_type != JOB_CHAT_INBOUND {
            return Err(FollowupError::InvalidJob(format!(
                "unexpected jobType {}",
                envelope.job_type
            )));
        }
        let signal: ReplySignal =
            serde_json::from_value(Value::Object(envelope.payload.clone()))
                .map_err(|e| FollowupError::InvalidJob(e.to_string()))?;

        let Some(config) = self.store.followup_config(&signal.campaign_id).await? else {
            debug!(campaign = %signal.campaign_id, "campaign gone, discarding reply signal");
            return Ok(FollowupOutcome::CampaignGone);
        };

        self.store
            .mark_recipient_responded(&signal.campaign_id, &signal.phone)
            .await?;

        if config.ai_handoff_on_reply {
            let job = Envelope::new(
                JOB_AI_HANDOFF,
                json!({
                    "campaignId": signal.campaign_id,
                    "phone": signal.phone,
                    "chatId": signal.chat_id,
                    "companyId": signal.company_id,
                }),
            );
            self.publisher
                .publish_job(
                    &self.broker_config.exchange_app,
                    JOB_AI_HANDOFF,
                    &job,
                    PublishOptions::default(),
                )
                .await?;
            info!(campaign = %signal.campaign_id, phone = %signal.phone, "handed off to agent");
            return Ok(FollowupOutcome::HandedOffToAgent);
        }

        if !config.auto_followups_enabled {
            return Ok(FollowupOutcome::FollowupsDisabled);
        }

        let Some(step) = self
            .store
            .next_pending_step(&signal.campaign_id, &signal.phone)
            .await?
        else {
            return Ok(FollowupOutcome::NothingPending);
        };
        let Some(content) = self.store.template_text(&step.template_id).await? else {
            warn!(template = %step.template_id, "follow-up template missing, skipping step");
            return Ok(FollowupOutcome::NothingPending);
        };

        let job = Envelope::new(
            JOB_MESSAGE_SEND,
            json!({
                "campaignId": signal.campaign_id,
                "phone": signal.phone,
                "chatId": signal.chat_id,
                "companyId": signal.company_id,
                "content": content,
                "followupStepId": step.id,
            }),
        );
        self.schedule(&job, step.delay_secs).await?;
        info!(
            campaign = %signal.campaign_id,
            step = %step.id,
            delay_secs = step.delay_secs,
            "follow-up step scheduled"
        );
        Ok(FollowupOutcome::StepScheduled {
            step_id: step.id,
            delay_secs: step.delay_secs,
        })
    }

    /// Park the job on the delay queue; expiry dead-letters it into the
    /// application exchange as an ordinary outbound request.
    async fn schedule(&self, job: &Envelope, delay_secs: u64) -> Result<()> {
        let options = PublishOptions {
            expiration_ms: Some(delay_secs.max(1) * 1000),
            ..Default::default()
        };
        self.publisher
            .publish_job(
                &self.broker_config.exchange_dlx,
                RK_FOLLOWUP_DELAY,
                job,
                options,
            )
            .await?;
        Ok(())
    }
}

impl DeliveryHandler for FollowupWorker {
    fn handle(&self, delivery: Delivery) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        let worker = self.clone();
        Box::pin(async move {
            match Envelope::from_slice(&delivery.data) {
                Ok(envelope) => {
                    // Fire-and-forget: a failed follow-up is not retried.
                    if let Err(e) = worker.process(&envelope).await {
                        warn!(error = %e, "follow-up processing failed");
                    }
                }
                Err(e) => warn!(error = %e, "malformed follow-up job, discarding"),
            }
            delivery.acker.ack(BasicAckOptions::default()).await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use tokio::sync::Mutex;

    use super::*;
    use crate::broker::mock::MockJobPublisher;

    #[derive(Default)]
    struct MemoryCampaignStore {
        campaigns: HashMap<String, CampaignFollowupConfig>,
        steps: HashMap<String, Vec<FollowupStep>>,
        templates: HashMap<String, String>,
        responded: Mutex<HashSet<(String, String)>>,
    }

    impl MemoryCampaignStore {
        fn with_campaign(mut self, id: &str, config: CampaignFollowupConfig) -> Self {
            self.campaigns.insert(id.to_string(), config);
            self
        }

        fn with_step(mut self, campaign_id: &str, step: FollowupStep) -> Self {
            self.steps.entry(campaign_id.to_string()).or_default().push(step);
            self
        }

        fn with_template(mut self, id: &str, text: &str) -> Self {
            self.templates.insert(id.to_string(), text.to_string());
            self
        }
    }

    #[async_trait]
    impl CampaignStore for MemoryCampaignStore {
        async fn followup_config(
            &self,
            campaign_id: &str,
        ) -> Result<Option<CampaignFollowupConfig>> {
            Ok(self.campaigns.get(campaign_id).cloned())
        }

        async fn mark_recipient_responded(&self, campaign_id: &str, phone: &str) -> Result<()> {
            self.responded
                .lock()
                .await
                .insert((campaign_id.to_string(), phone.to_string()));
            Ok(())
        }

        async fn next_pending_step(
            &self,
            campaign_id: &str,
            _phone: &str,
        ) -> Result<Option<FollowupStep>> {
            Ok(self
                .steps
                .get(campaign_id)
                .and_then(|steps| steps.iter().min_by_key(|s| s.position))
                .cloned())
        }

        async fn template_text(&self, template_id: &str) -> Result<Option<String>> {
            Ok(self.templates.get(template_id).cloned())
        }
    }

    fn signal_envelope() -> Envelope {
        Envelope::new(
            JOB_CHAT_INBOUND,
            json!({
                "campaignId": "cmp-1",
                "phone": "5511999990000",
                "chatId": "c1",
                "companyId": "acme",
            }),
        )
    }

    fn step() -> FollowupStep {
        FollowupStep {
            id: "step-1".to_string(),
            template_id: "tpl-1".to_string(),
            delay_secs: 3600,
            position: 0,
        }
    }

    fn worker(store: MemoryCampaignStore) -> (Arc<MockJobPublisher>, FollowupWorker) {
        let publisher = Arc::new(MockJobPublisher::new());
        let worker = FollowupWorker::new(
            publisher.clone(),
            Arc::new(store),
            BrokerConfig::default(),
        );
        (publisher, worker)
    }

    #[tokio::test]
    async fn test_deleted_campaign_is_discarded() {
        let (publisher, worker) = worker(MemoryCampaignStore::default());

        let outcome = worker.process(&signal_envelope()).await.unwrap();
        assert_eq!(outcome, FollowupOutcome::CampaignGone);
        assert_eq!(publisher.published_count().await, 0);
    }

    #[tokio::test]
    async fn test_ai_handoff_publishes_to_app_exchange() {
        let store = MemoryCampaignStore::default().with_campaign(
            "cmp-1",
            CampaignFollowupConfig {
                ai_handoff_on_reply: true,
                auto_followups_enabled: true,
            },
        );
        let (publisher, worker) = worker(store);

        let outcome = worker.process(&signal_envelope()).await.unwrap();
        assert_eq!(outcome, FollowupOutcome::HandedOffToAgent);

        let jobs = publisher.take_published().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].exchange, "livechat.app");
        assert_eq!(jobs[0].routing_key, JOB_AI_HANDOFF);
        assert_eq!(jobs[0].envelope.job_type, JOB_AI_HANDOFF);
        assert_eq!(jobs[0].envelope.field("campaignId"), Some(&json!("cmp-1")));
    }

    #[tokio::test]
    async fn test_scripted_step_rides_the_delay_queue() {
        let store = MemoryCampaignStore::default()
            .with_campaign(
                "cmp-1",
                CampaignFollowupConfig {
                    ai_handoff_on_reply: false,
                    auto_followups_enabled: true,
                },
            )
            .with_step("cmp-1", step())
            .with_template("tpl-1", "Oi! Ainda tem interesse?");
        let (publisher, worker) = worker(store);

        let outcome = worker.process(&signal_envelope()).await.unwrap();
        assert_eq!(
            outcome,
            FollowupOutcome::StepScheduled {
                step_id: "step-1".to_string(),
                delay_secs: 3600,
            }
        );

        let jobs = publisher.take_published().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].exchange, "livechat.dlx");
        assert_eq!(jobs[0].routing_key, RK_FOLLOWUP_DELAY);
        assert_eq!(jobs[0].options.expiration_ms, Some(3_600_000));
        assert_eq!(jobs[0].envelope.job_type, JOB_MESSAGE_SEND);
        assert_eq!(
            jobs[0].envelope.field("content"),
            Some(&json!("Oi! Ainda tem interesse?"))
        );
        assert_eq!(jobs[0].envelope.field("phone"), Some(&json!("5511999990000")));
    }

    #[tokio::test]
    async fn test_recipient_marked_responded() {
        let store = Arc::new(MemoryCampaignStore::default().with_campaign(
            "cmp-1",
            CampaignFollowupConfig {
                ai_handoff_on_reply: false,
                auto_followups_enabled: false,
            },
        ));
        let publisher = Arc::new(MockJobPublisher::new());
        let worker = FollowupWorker::new(publisher.clone(), store.clone(), BrokerConfig::default());

        let outcome = worker.process(&signal_envelope()).await.unwrap();
        assert_eq!(outcome, FollowupOutcome::FollowupsDisabled);
        assert!(store
            .responded
            .lock()
            .await
            .contains(&("cmp-1".to_string(), "5511999990000".to_string())));
        assert_eq!(publisher.published_count().await, 0);
    }

    #[tokio::test]
    async fn test_exhausted_script_schedules_nothing() {
        let store = MemoryCampaignStore::default().with_campaign(
            "cmp-1",
            CampaignFollowupConfig {
                ai_handoff_on_reply: false,
                auto_followups_enabled: true,
            },
        );
        let (publisher, worker) = worker(store);

        let outcome = worker.process(&signal_envelope()).await.unwrap();
        assert_eq!(outcome, FollowupOutcome::NothingPending);
        assert_eq!(publisher.published_count().await, 0);
    }

    #[tokio::test]
    async fn test_missing_template_skips_step() {
        let store = MemoryCampaignStore::default()
            .with_campaign(
                "cmp-1",
                CampaignFollowupConfig {
                    ai_handoff_on_reply: false,
                    auto_followups_enabled: true,
                },
            )
            .with_step("cmp-1", step());
        let (publisher, worker) = worker(store);

        let outcome = worker.process(&signal_envelope()).await.unwrap();
        assert_eq!(outcome, FollowupOutcome::NothingPending);
        assert_eq!(publisher.published_count().await, 0);
    }

    #[tokio::test]
    async fn test_unexpected_job_type_is_rejected() {
        let (publisher, worker) = worker(MemoryCampaignStore::default());

        let envelope = Envelope::new("message.send", json!({"campaignId": "cmp-1"}));
        let result = worker.process(&envelope).await;
        assert!(matches!(result, Err(FollowupError::InvalidJob(_))));
        assert_eq!(publisher.published_count().await, 0);
    }

    #[tokio::test]
    async fn test_zero_delay_still_gets_minimum_expiration() {
        let store = MemoryCampaignStore::default()
            .with_campaign(
                "cmp-1",
                CampaignFollowupConfig {
                    ai_handoff_on_reply: false,
                    auto_followups_enabled: true,
                },
            )
            .with_step(
                "cmp-1",
                FollowupStep {
                    delay_secs: 0,
                    ..step()
                },
            )
            .with_template("tpl-1", "hi");
        let (publisher, worker) = worker(store);

        worker.process(&signal_envelope()).await.unwrap();
        let jobs = publisher.take_published().await;
        assert_eq!(jobs[0].options.expiration_ms, Some(1_000));
    }
}
