use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery medium a notification can be sent over.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Websocket push to the recipient's open sessions.
    Push,
    /// Email through the configured HTTP email API.
    Email,
    /// Outbound stream consumed by external systems.
    Queue,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 3] = [ChannelKind::Push, ChannelKind::Email, ChannelKind::Queue];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Push => "push",
            ChannelKind::Email => "email",
            ChannelKind::Queue => "queue",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(ChannelKind::Push),
            "email" => Ok(ChannelKind::Email),
            "queue" => Ok(ChannelKind::Queue),
            other => Err(format!("unknown channel '{}'", other)),
        }
    }
}

/// State of one (notification, channel) delivery attempt.
///
/// `Sent`, `FailedTerminal` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Queued,
    Sending,
    Sent,
    FailedTransient,
    FailedTerminal,
    Cancelled,
}

impl ChannelState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChannelState::Sent | ChannelState::FailedTerminal | ChannelState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Queued => "queued",
            ChannelState::Sending => "sending",
            ChannelState::Sent => "sent",
            ChannelState::FailedTransient => "failed_transient",
            ChannelState::FailedTerminal => "failed_terminal",
            ChannelState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(ChannelState::Queued),
            "sending" => Ok(ChannelState::Sending),
            "sent" => Ok(ChannelState::Sent),
            "failed_transient" => Ok(ChannelState::FailedTransient),
            "failed_terminal" => Ok(ChannelState::FailedTerminal),
            "cancelled" => Ok(ChannelState::Cancelled),
            other => Err(format!("unknown channel state '{}'", other)),
        }
    }
}

/// Aggregate delivery status of a notification, derived from its channel states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    InProgress,
    Delivered,
    PartiallyFailed,
    Failed,
    Cancelled,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::InProgress => "in_progress",
            NotificationStatus::Delivered => "delivered",
            NotificationStatus::PartiallyFailed => "partially_failed",
            NotificationStatus::Failed => "failed",
            NotificationStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(NotificationStatus::Pending),
            "in_progress" => Ok(NotificationStatus::InProgress),
            "delivered" => Ok(NotificationStatus::Delivered),
            "partially_failed" => Ok(NotificationStatus::PartiallyFailed),
            "failed" => Ok(NotificationStatus::Failed),
            "cancelled" => Ok(NotificationStatus::Cancelled),
            other => Err(format!("unknown notification status '{}'", other)),
        }
    }
}

/// Notification priority. Each level has its own ready queue per channel and
/// workers drain higher levels first. Ordered `Low < Normal < High`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Highest first, the order workers drain the ready queues in.
    pub const DRAIN_ORDER: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// Who a notification is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    /// Opaque recipient reference (user id in the calling system).
    pub id: String,
    /// Required when the email channel is requested.
    #[serde(default)]
    pub email: Option<String>,
}

/// Opaque notification content plus an optional template reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    #[serde(default)]
    pub template: Option<String>,
    pub content: serde_json::Value,
}

/// Submission accepted at the intake boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub recipient: Recipient,
    pub channels: Vec<ChannelKind>,
    pub payload: NotificationPayload,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// A unit of work requesting delivery of content to a recipient.
///
/// Everything except the status fields is fixed at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub recipient: Recipient,
    /// Sorted and de-duplicated.
    pub channels: Vec<ChannelKind>,
    pub payload: NotificationPayload,
    pub priority: Priority,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,

    /// Last recorded aggregate status.
    pub status: NotificationStatus,
    /// Bumped on every attempt write; guards `status` updates.
    pub version: i64,
    /// When every channel reached a terminal state.
    pub settled_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    /// Hidden from the inbox by the recipient.
    pub dismissed_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl Notification {
    /// Build a fresh `pending` notification from an already validated request.
    pub fn new(request: SubmitRequest, now: DateTime<Utc>) -> Self {
        let mut channels = request.channels;
        channels.sort();
        channels.dedup();

        Self {
            id: Uuid::new_v4(),
            recipient: request.recipient,
            channels,
            payload: request.payload,
            priority: request.priority,
            idempotency_key: request.idempotency_key,
            created_at: now,
            status: NotificationStatus::Pending,
            version: 0,
            settled_at: None,
            cancelled_at: None,
            read_at: None,
            dismissed_at: None,
            archived_at: None,
        }
    }

    /// Attempt #1 in `queued` state for every requested channel.
    pub fn initial_attempts(&self) -> Vec<DeliveryAttempt> {
        self.channels
            .iter()
            .map(|channel| DeliveryAttempt::queued(self.id, *channel, 1, self.created_at))
            .collect()
    }

    pub fn is_read(&self) -> bool {
        self.read_at.is_some()
    }
}

/// One try to deliver a notification over one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub notification_id: Uuid,
    pub channel: ChannelKind,
    /// 1-based, strictly increasing per channel.
    pub attempt_number: u32,
    pub state: ChannelState,
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryAttempt {
    pub fn queued(
        notification_id: Uuid,
        channel: ChannelKind,
        attempt_number: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            notification_id,
            channel,
            attempt_number,
            state: ChannelState::Queued,
            error_detail: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Message placed on the bus for one (notification, channel, attempt).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchTask {
    pub notification_id: Uuid,
    pub channel: ChannelKind,
    pub attempt_number: u32,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
}

impl DispatchTask {
    pub fn for_attempt(attempt: &DeliveryAttempt, priority: Priority) -> Self {
        Self {
            notification_id: attempt.notification_id,
            channel: attempt.channel,
            attempt_number: attempt.attempt_number,
            priority,
            enqueued_at: Utc::now(),
        }
    }
}

/// Per-channel line of a status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelReport {
    pub channel: ChannelKind,
    pub state: ChannelState,
    /// Number of attempts made or scheduled so far.
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Result of a status query, always recomputed from the attempt history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub notification_id: Uuid,
    pub status: NotificationStatus,
    pub settled: bool,
    pub channels: Vec<ChannelReport>,
}

impl StatusReport {
    pub fn channel(&self, channel: ChannelKind) -> Option<&ChannelReport> {
        self.channels.iter().find(|c| c.channel == channel)
    }
}

/// Keyset position in a recipient's inbox, ordered by `(created_at desc, id desc)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxCursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

/// One page of a recipient's notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxPage {
    pub items: Vec<Notification>,
    pub next_cursor: Option<InboxCursor>,
    pub has_next: bool,
}

impl InboxPage {
    /// Build a page from up to `limit + 1` rows fetched in inbox order.
    pub fn from_rows(mut rows: Vec<Notification>, limit: usize) -> Self {
        let has_next = rows.len() > limit;
        rows.truncate(limit);
        let next_cursor = if has_next {
            rows.last().map(|n| InboxCursor {
                created_at: n.created_at,
                id: n.id,
            })
        } else {
            None
        };

        Self {
            items: rows,
            next_cursor,
            has_next,
        }
    }
}
