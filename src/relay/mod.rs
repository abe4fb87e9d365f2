//! Realtime relay.
//!
//! A dedicated consumer that drains the socket-delivery queue and re-emits
//! each event to the matching session room(s), so no backend process needs
//! a direct line to live client connections.
//!
//! Realtime notification is best-effort: malformed payloads and emission
//! failures drop the delivery (nack without requeue) rather than stall the
//! queue on a poison message.

mod hub;

pub use hub::{Frame, SessionHub};

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::broker::{BrokerClient, DeliveryHandler, HandlerError};

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors that can occur during event emission.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Emit failed: {0}")]
    Emit(String),
}

/// Room for a single conversation.
pub fn chat_room(chat_id: &str) -> String {
    format!("chat:{chat_id}")
}

/// Room for a tenant's list views.
pub fn company_room(company_id: &str) -> String {
    format!("company:{company_id}")
}

/// Room for a single user's notifications.
pub fn user_room(user_id: &str) -> String {
    format!("user:{user_id}")
}

/// Realtime gateway seam.
///
/// The relay only needs room-targeted and process-wide emission; the
/// connection table lives behind this trait.
///
/// Implementations:
/// - `SessionHub`: in-process room registry
#[async_trait]
pub trait SessionGateway: Send + Sync {
    async fn emit_to_room(&self, room: &str, event: &str, payload: Value) -> Result<()>;

    async fn emit_all(&self, event: &str, payload: Value) -> Result<()>;
}

/// Queue payloads the relay understands.
///
/// Unknown kinds deserialize to `Unknown` and are ignored, so producers
/// can ship new event shapes ahead of this consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum SocketEvent {
    #[serde(rename = "inbound.message")]
    InboundMessage {
        #[serde(rename = "chatId")]
        chat_id: String,
        message: Value,
        #[serde(rename = "chatUpdate", default, skip_serializing_if = "Option::is_none")]
        chat_update: Option<Value>,
        #[serde(rename = "companyId", default, skip_serializing_if = "Option::is_none")]
        company_id: Option<String>,
    },
    #[serde(rename = "outbound.message")]
    OutboundMessage {
        #[serde(rename = "chatId")]
        chat_id: String,
        message: Value,
        #[serde(rename = "chatUpdate", default, skip_serializing_if = "Option::is_none")]
        chat_update: Option<Value>,
        #[serde(rename = "companyId", default, skip_serializing_if = "Option::is_none")]
        company_id: Option<String>,
    },
    #[serde(rename = "message.status")]
    MessageStatus {
        #[serde(rename = "chatId")]
        chat_id: String,
        #[serde(rename = "messageId", default)]
        message_id: Option<String>,
        #[serde(rename = "externalId", default)]
        external_id: Option<String>,
        #[serde(default)]
        view_status: Option<String>,
        #[serde(default)]
        raw_status: Option<String>,
    },
    #[serde(rename = "notification")]
    Notification {
        #[serde(rename = "userId")]
        user_id: String,
        notification: Value,
    },
    #[serde(other)]
    Unknown,
}

/// The relay consumer.
#[derive(Clone)]
pub struct RealtimeRelay {
    gateway: Arc<dyn SessionGateway>,
}

impl RealtimeRelay {
    pub fn new(gateway: Arc<dyn SessionGateway>) -> Self {
        Self { gateway }
    }

    /// Register this relay on the socket-delivery queue.
    pub async fn start(self, broker: &Arc<BrokerClient>) -> crate::broker::Result<()> {
        let queue = broker.config().queue_socket.clone();
        Arc::clone(broker).consume(&queue, Arc::new(self)).await
    }

    /// Fan an event out to its rooms.
    pub async fn dispatch(&self, event: SocketEvent) -> Result<()> {
        match event {
            SocketEvent::InboundMessage {
                chat_id,
                message,
                chat_update,
                company_id,
            } => {
                self.dispatch_message("message:inbound", chat_id, message, chat_update, company_id)
                    .await
            }
            SocketEvent::OutboundMessage {
                chat_id,
                message,
                chat_update,
                company_id,
            } => {
                self.dispatch_message("message:outbound", chat_id, message, chat_update, company_id)
                    .await
            }
            SocketEvent::MessageStatus {
                chat_id,
                message_id,
                external_id,
                view_status,
                raw_status,
            } => {
                let payload = json!({
                    "chatId": chat_id,
                    "messageId": message_id,
                    "externalId": external_id,
                    "view_status": view_status,
                    "raw_status": raw_status,
                });
                self.gateway
                    .emit_to_room(&chat_room(&chat_id), "message:status", payload)
                    .await
            }
            SocketEvent::Notification {
                user_id,
                notification,
            } => {
                self.gateway
                    .emit_to_room(&user_room(&user_id), "notification", notification)
                    .await
            }
            SocketEvent::Unknown => {
                debug!("ignoring unknown socket event kind");
                Ok(())
            }
        }
    }

    async fn dispatch_message(
        &self,
        direction_event: &str,
        chat_id: String,
        message: Value,
        chat_update: Option<Value>,
        company_id: Option<String>,
    ) -> Result<()> {
        let room = chat_room(&chat_id);
        self.gateway
            .emit_to_room(&room, "message:new", message.clone())
            .await?;
        self.gateway
            .emit_to_room(&room, direction_event, message)
            .await?;

        if let Some(update) = chat_update {
            match company_id {
                Some(company_id) => {
                    self.gateway
                        .emit_to_room(&company_room(&company_id), "chat:updated", update)
                        .await?;
                }
                // Producers that predate company scoping fall back to a
                // process-wide broadcast.
                None => self.gateway.emit_all("chat:updated", update).await?,
            }
        }
        Ok(())
    }
}

impl DeliveryHandler for RealtimeRelay {
    fn handle(&self, delivery: Delivery) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        let relay = self.clone();
        Box::pin(async move {
            match serde_json::from_slice::<SocketEvent>(&delivery.data) {
                Ok(event) => match relay.dispatch(event).await {
                    Ok(()) => delivery.acker.ack(BasicAckOptions::default()).await?,
                    Err(e) => {
                        error!(error = %e, "relay emit failed, dropping event");
                        delivery
                            .acker
                            .nack(BasicNackOptions {
                                requeue: false,
                                ..Default::default()
                            })
                            .await?;
                    }
                },
                Err(e) => {
                    warn!(error = %e, "malformed socket event, dropping");
                    delivery
                        .acker
                        .nack(BasicNackOptions {
                            requeue: false,
                            ..Default::default()
                        })
                        .await?;
                }
            }
            Ok(())
        })
    }
}
