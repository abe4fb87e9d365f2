//! In-process session hub.
//!
//! Room membership lives only in this connection table: sessions join a
//! room and receive protocol frames until they drop the receiver. Nothing
//! is persisted.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use super::{Result, SessionGateway};

const ROOM_BUFFER: usize = 256;

/// A client-facing protocol frame: event name plus JSON body.
#[derive(Debug, Clone)]
pub struct Frame {
    pub event: String,
    pub payload: Value,
}

/// Room registry backing the `SessionGateway` seam.
pub struct SessionHub {
    rooms: RwLock<HashMap<String, broadcast::Sender<Frame>>>,
    global: broadcast::Sender<Frame>,
}

impl SessionHub {
    pub fn new() -> Self {
        let (global, _) = broadcast::channel(ROOM_BUFFER);
        Self {
            rooms: RwLock::new(HashMap::new()),
            global,
        }
    }

    /// Join a room, creating it on first subscription.
    pub async fn join(&self, room: &str) -> broadcast::Receiver<Frame> {
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room.to_string())
            .or_insert_with(|| broadcast::channel(ROOM_BUFFER).0)
            .subscribe()
    }

    /// Process-wide frames, received regardless of room membership.
    pub fn subscribe_global(&self) -> broadcast::Receiver<Frame> {
        self.global.subscribe()
    }

    /// Drop rooms nobody listens to anymore.
    pub async fn prune(&self) {
        let mut rooms = self.rooms.write().await;
        rooms.retain(|_, sender| sender.receiver_count() > 0);
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

impl Default for SessionHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionGateway for SessionHub {
    async fn emit_to_room(&self, room: &str, event: &str, payload: Value) -> Result<()> {
        let rooms = self.rooms.read().await;
        if let Some(sender) = rooms.get(room) {
            // A send error just means no live receivers; rooms outlive
            // their last session until pruned.
            let _ = sender.send(Frame {
                event: event.to_string(),
                payload,
            });
        } else {
            debug!(room = %room, event = %event, "no sessions in room");
        }
        Ok(())
    }

    async fn emit_all(&self, event: &str, payload: Value) -> Result<()> {
        let _ = self.global.send(Frame {
            event: event.to_string(),
            payload,
        });
        Ok(())
    }
}
