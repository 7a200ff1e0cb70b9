//! Websocket push channel.
//!
//! Gateway connections register a session per socket; sending a notification
//! hands a JSON frame to every open session of the recipient. A recipient with
//! no open session is a transient failure, so the notification is retried
//! until they come online or the attempts run out.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use courier_common::error::ChannelError;
use courier_common::types::{ChannelKind, Notification};
use courier_engine::ports::ChannelSender;

use crate::template::TemplateRegistry;

/// Frame written to the socket.
#[derive(Debug, Serialize)]
struct PushFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    id: Uuid,
    subject: &'a str,
    body: &'a str,
    content: &'a serde_json::Value,
    created_at: chrono::DateTime<chrono::Utc>,
}

struct Session {
    id: Uuid,
    frames: mpsc::UnboundedSender<String>,
}

/// Open websocket sessions by recipient id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Vec<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session; frames for the recipient arrive on the returned receiver.
    pub async fn connect(&self, recipient_id: &str) -> (Uuid, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.sessions
            .write()
            .await
            .entry(recipient_id.to_string())
            .or_default()
            .push(Session { id, frames: tx });

        tracing::debug!(recipient = %recipient_id, session_id = %id, "Push session opened");
        (id, rx)
    }

    pub async fn disconnect(&self, recipient_id: &str, session_id: Uuid) {
        let mut sessions = self.sessions.write().await;
        if let Some(list) = sessions.get_mut(recipient_id) {
            list.retain(|s| s.id != session_id);
            if list.is_empty() {
                sessions.remove(recipient_id);
            }
        }
        tracing::debug!(recipient = %recipient_id, session_id = %session_id, "Push session closed");
    }

    pub async fn session_count(&self, recipient_id: &str) -> usize {
        self.sessions
            .read()
            .await
            .get(recipient_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Hand `frame` to every open session of the recipient. Returns how many
    /// accepted it; sessions whose socket task is gone are pruned.
    pub async fn deliver(&self, recipient_id: &str, frame: &str) -> usize {
        let mut sessions = self.sessions.write().await;
        let Some(list) = sessions.get_mut(recipient_id) else {
            return 0;
        };

        list.retain(|s| s.frames.send(frame.to_string()).is_ok());
        let delivered = list.len();
        if list.is_empty() {
            sessions.remove(recipient_id);
        }
        delivered
    }
}

pub struct PushSender {
    sessions: Arc<SessionRegistry>,
    templates: Arc<TemplateRegistry>,
}

impl PushSender {
    pub fn new(sessions: Arc<SessionRegistry>, templates: Arc<TemplateRegistry>) -> Self {
        Self {
            sessions,
            templates,
        }
    }
}

#[async_trait]
impl ChannelSender for PushSender {
    fn channel(&self) -> ChannelKind {
        ChannelKind::Push
    }

    async fn send(&self, notification: &Notification) -> Result<(), ChannelError> {
        let rendered = self.templates.render(&notification.payload)?;
        let frame = PushFrame {
            kind: "notification",
            id: notification.id,
            subject: &rendered.subject,
            body: &rendered.body,
            content: &notification.payload.content,
            created_at: notification.created_at,
        };
        let frame = serde_json::to_string(&frame)
            .map_err(|e| ChannelError::Terminal(format!("unencodable push frame: {}", e)))?;

        let delivered = self.sessions.deliver(&notification.recipient.id, &frame).await;
        if delivered == 0 {
            return Err(ChannelError::Transient(format!(
                "no open push session for recipient {}",
                notification.recipient.id
            )));
        }

        tracing::debug!(
            notification_id = %notification.id,
            sessions = delivered,
            "Push frame delivered"
        );
        Ok(())
    }
}
