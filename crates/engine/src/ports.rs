//! Port traits the dispatch core talks to.
//!
//! Postgres/Redis implementations live in `store`, `idempotency` and `queue`;
//! in-memory ones in `memory`. Channel senders are implemented by the notifier.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use courier_common::error::{AppError, ChannelError};
use courier_common::types::{
    ChannelKind, ChannelState, DeliveryAttempt, DispatchTask, InboxCursor, Notification,
    NotificationStatus,
};

use crate::fanout::{self, IllegalTransition};

/// Result of inserting a new notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Inserted,
    /// Another notification already owns the idempotency key.
    DuplicateKey { existing_id: Uuid },
}

/// Conditional state change of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptTransition {
    pub notification_id: Uuid,
    pub channel: ChannelKind,
    pub attempt_number: u32,
    pub from: ChannelState,
    pub to: ChannelState,
    pub error_detail: Option<String>,
    pub at: DateTime<Utc>,
}

impl AttemptTransition {
    /// Build a transition, rejecting edges the fan-out state machine forbids.
    pub fn new(
        notification_id: Uuid,
        channel: ChannelKind,
        attempt_number: u32,
        from: ChannelState,
        to: ChannelState,
    ) -> Result<Self, IllegalTransition> {
        fanout::check(from, to)?;
        Ok(Self {
            notification_id,
            channel,
            attempt_number,
            from,
            to,
            error_detail: None,
            at: Utc::now(),
        })
    }

    pub fn with_error(mut self, detail: impl Into<String>) -> Self {
        self.error_detail = Some(detail.into());
        self
    }
}

/// Source of truth for notifications and their attempt history.
///
/// Every attempt write bumps the owning notification's `version`.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Insert a notification together with its initial attempts, atomically.
    async fn save(
        &self,
        notification: &Notification,
        attempts: &[DeliveryAttempt],
    ) -> Result<SaveOutcome, AppError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Notification>, AppError>;

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Notification>, AppError>;

    /// All attempts of a notification, ordered by channel then attempt number.
    async fn attempts(&self, id: Uuid) -> Result<Vec<DeliveryAttempt>, AppError>;

    /// Append `attempt` only if the channel's latest attempt number is `expected_prior`.
    ///
    /// Returns `false` when another writer got there first.
    async fn append_attempt(
        &self,
        attempt: &DeliveryAttempt,
        expected_prior: u32,
    ) -> Result<bool, AppError>;

    /// Apply `change` only if the attempt is still in `change.from`.
    async fn transition_attempt(&self, change: &AttemptTransition) -> Result<bool, AppError>;

    /// Record the aggregate status if the notification is still at `expected_version`.
    async fn record_status(
        &self,
        id: Uuid,
        status: NotificationStatus,
        settled: bool,
        expected_version: i64,
    ) -> Result<bool, AppError>;

    async fn mark_cancelled(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), AppError>;

    /// Up to `limit + 1` visible notifications for a recipient, newest first,
    /// strictly after `cursor`. Archived and dismissed ones are never listed;
    /// `unread_only` also drops the ones already read.
    async fn list_for_recipient(
        &self,
        recipient_id: &str,
        cursor: Option<InboxCursor>,
        limit: usize,
        unread_only: bool,
    ) -> Result<Vec<Notification>, AppError>;

    /// Returns `false` if no such notification belongs to the recipient.
    async fn mark_read(&self, id: Uuid, recipient_id: &str) -> Result<bool, AppError>;

    async fn mark_all_read(&self, recipient_id: &str) -> Result<u64, AppError>;

    /// Hide a notification from the recipient's inbox. Delivery is unaffected.
    ///
    /// Returns `false` if no such notification belongs to the recipient.
    async fn dismiss(&self, id: Uuid, recipient_id: &str) -> Result<bool, AppError>;

    async fn dismiss_all(&self, recipient_id: &str) -> Result<u64, AppError>;

    /// Queued attempts last touched before `older_than`; their `updated_at` is
    /// bumped to `now` so concurrent sweepers do not republish them twice.
    async fn requeue_stale(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryAttempt>, AppError>;

    /// Latest attempts left in `sending` or `failed_transient` since before
    /// `older_than`, on notifications that are not archived. Their `updated_at`
    /// is bumped to `now` like [`NotificationStore::requeue_stale`].
    async fn stalled_attempts(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryAttempt>, AppError>;

    /// Notifications not yet marked settled whose channels have all reached a
    /// terminal state, i.e. whose recorded status is behind their attempts.
    async fn finished_unsettled(&self, limit: usize) -> Result<Vec<Uuid>, AppError>;

    /// Archive notifications settled before `settled_before`. Returns the count.
    async fn archive_settled(&self, settled_before: DateTime<Utc>) -> Result<u64, AppError>;
}

/// Identifies one acquisition of an idempotency lock.
///
/// Release only deletes the lock while it still carries this token, so a
/// holder whose TTL ran out cannot drop a lock that was taken again since.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Short-lived, best-effort coordination locks (never a durability guarantee).
#[async_trait]
pub trait IdempotencyLocks: Send + Sync {
    /// A fresh token if the lock was acquired, `None` if someone else holds it.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>, AppError>;

    async fn release(&self, key: &str, token: &LockToken) -> Result<(), AppError>;
}

/// A task handed to a consumer, with the receipt needed to acknowledge it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub task: DispatchTask,
    pub receipt: String,
}

/// Dispatch task queue, one logical queue per channel kind.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Enqueue `task` on its channel's queue, visible after `delay` if given.
    async fn publish(&self, task: &DispatchTask, delay: Option<Duration>) -> Result<(), AppError>;

    /// Next ready task for `channel`, or `None` when nothing is ready.
    async fn next_task(&self, channel: ChannelKind) -> Result<Option<Delivery>, AppError>;

    /// Acknowledge a task once it has been fully processed.
    async fn ack(&self, delivery: &Delivery) -> Result<(), AppError>;
}

/// Delivers a notification over one channel kind.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    fn channel(&self) -> ChannelKind;

    async fn send(&self, notification: &Notification) -> Result<(), ChannelError>;
}
