//! Email channel over a Resend-compatible HTTP API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;

use courier_common::error::{AppError, ChannelError};
use courier_common::types::{ChannelKind, Notification};
use courier_engine::ports::ChannelSender;

use crate::template::TemplateRegistry;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct EmailRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    text: &'a str,
}

pub struct EmailSender {
    client: Client,
    api_url: String,
    api_key: String,
    from: String,
    templates: Arc<TemplateRegistry>,
}

impl EmailSender {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        from: impl Into<String>,
        templates: Arc<TemplateRegistry>,
    ) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AppError::Config(format!("failed to build http client: {}", e)))?;

        Ok(Self {
            client,
            api_url: api_url.into(),
            api_key: api_key.into(),
            from: from.into(),
            templates,
        })
    }
}

/// Map a non-success provider response onto a channel error.
///
/// Rate limiting and server errors are worth retrying; any other client error
/// means the request itself is wrong.
pub fn classify_status(status: StatusCode, body: &str) -> ChannelError {
    let detail = format!("email API returned {}: {}", status, body.trim());
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        ChannelError::Transient(detail)
    } else {
        ChannelError::Terminal(detail)
    }
}

#[async_trait]
impl ChannelSender for EmailSender {
    fn channel(&self) -> ChannelKind {
        ChannelKind::Email
    }

    async fn send(&self, notification: &Notification) -> Result<(), ChannelError> {
        let to = notification
            .recipient
            .email
            .as_deref()
            .ok_or_else(|| ChannelError::Terminal("recipient has no email address".to_string()))?;
        let rendered = self.templates.render(&notification.payload)?;

        let request = EmailRequest {
            from: &self.from,
            to: [to],
            subject: &rendered.subject,
            text: &rendered.body,
        };

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ChannelError::Transient(format!("email API unreachable: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(notification_id = %notification.id, "Email accepted by provider");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }
}
