//! Outbound queue channel: appends each notification to a Redis stream that
//! external systems consume.

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use courier_common::error::ChannelError;
use courier_common::types::{ChannelKind, Notification};
use courier_engine::ports::ChannelSender;

/// Approximate cap on stream length; older entries are trimmed.
const STREAM_MAX_LEN: usize = 100_000;

pub struct OutboundStreamSender {
    redis: ConnectionManager,
    stream: String,
}

impl OutboundStreamSender {
    pub fn new(redis: ConnectionManager, stream: impl Into<String>) -> Self {
        Self {
            redis,
            stream: stream.into(),
        }
    }
}

/// Field/value pairs of one stream entry.
fn stream_fields(notification: &Notification) -> Result<Vec<(&'static str, String)>, ChannelError> {
    let payload = serde_json::to_string(&notification.payload)
        .map_err(|e| ChannelError::Terminal(format!("unencodable payload: {}", e)))?;

    Ok(vec![
        ("notification_id", notification.id.to_string()),
        ("recipient_id", notification.recipient.id.clone()),
        ("priority", notification.priority.to_string()),
        ("payload", payload),
        ("created_at", notification.created_at.to_rfc3339()),
    ])
}

#[async_trait]
impl ChannelSender for OutboundStreamSender {
    fn channel(&self) -> ChannelKind {
        ChannelKind::Queue
    }

    async fn send(&self, notification: &Notification) -> Result<(), ChannelError> {
        let fields = stream_fields(notification)?;
        let mut conn = self.redis.clone();

        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(STREAM_MAX_LEN)
            .arg("*");
        for (field, value) in &fields {
            cmd.arg(*field).arg(value);
        }

        let entry_id: String = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| ChannelError::Transient(format!("outbound stream write failed: {}", e)))?;

        tracing::debug!(
            notification_id = %notification.id,
            stream = %self.stream,
            entry_id = %entry_id,
            "Notification appended to outbound stream"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use courier_common::types::{NotificationPayload, Priority, Recipient, SubmitRequest};

    #[test]
    fn test_stream_fields() {
        let n = Notification::new(
            SubmitRequest {
                recipient: Recipient {
                    id: "user-9".to_string(),
                    email: None,
                },
                channels: vec![ChannelKind::Queue],
                payload: NotificationPayload {
                    template: Some("welcome".to_string()),
                    content: serde_json::json!({"name": "Ada"}),
                },
                priority: Priority::Low,
                idempotency_key: None,
            },
            Utc::now(),
        );

        let fields = stream_fields(&n).unwrap();
        let get = |name: &str| {
            fields
                .iter()
                .find(|(f, _)| *f == name)
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        assert_eq!(get("notification_id"), n.id.to_string());
        assert_eq!(get("recipient_id"), "user-9");
        assert_eq!(get("priority"), "low");

        let payload: NotificationPayload = serde_json::from_str(&get("payload")).unwrap();
        assert_eq!(payload, n.payload);
    }
}
