use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::command::{AuthReply, BacklogBatch, Channel, MessageRecord};

/// Events published by the client. Persistence-backed events (`message`,
/// `backlog`) fire only after their store transaction durably commits.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ClientEvent {
    ConnectionOpening,
    ConnectionOpen,
    ConnectionClosing,
    ConnectionClose,
    RawCommand { command: Value },
    Auth { reply: AuthReply },
    Message { message: MessageRecord },
    Backlog { batch: BacklogBatch },
    Join { channel: Channel },
    Part { channel: Channel },
}

impl ClientEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ConnectionOpening => "connection-opening",
            Self::ConnectionOpen => "connection-open",
            Self::ConnectionClosing => "connection-closing",
            Self::ConnectionClose => "connection-close",
            Self::RawCommand { .. } => "raw-command",
            Self::Auth { .. } => "auth",
            Self::Message { .. } => "message",
            Self::Backlog { .. } => "backlog",
            Self::Join { .. } => "join",
            Self::Part { .. } => "part",
        }
    }
}

/// Subscribe-by-name publish/subscribe fabric. One broadcast channel per
/// event name, created lazily on first subscription; publishing with no
/// subscribers is a no-op.
pub struct EventBus {
    channels: DashMap<String, broadcast::Sender<ClientEvent>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity,
        }
    }

    pub fn subscribe(&self, name: &str) -> broadcast::Receiver<ClientEvent> {
        self.channels
            .entry(name.to_owned())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub fn publish(&self, event: ClientEvent) {
        if let Some(tx) = self.channels.get(event.event_type()) {
            // Send fails only when every receiver is gone; that's fine.
            let _ = tx.send(event);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
