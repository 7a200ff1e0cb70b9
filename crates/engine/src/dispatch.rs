//! Dispatch service: intake, fan-out, outcome handling and status tracking.
//!
//! Intake validates a request, persists the notification with attempt #1 per
//! channel, and publishes one task per channel. Workers hand each task to
//! [`DispatchService::on_task`], which claims the attempt, sends it through the
//! channel adapter and records the outcome, scheduling retries with backoff.
//!
//! Persistence and bus failures propagate to the caller untouched; the only
//! retries this service owns are channel delivery retries. Work left behind by
//! such a failure is picked up again through [`DispatchService::republish`] and
//! [`DispatchService::recover_stalled`], which the sweeper drives.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use courier_common::error::{ChannelError, DispatchError};
use courier_common::types::{
    ChannelKind, ChannelState, DeliveryAttempt, DispatchTask, Notification, StatusReport,
    SubmitRequest,
};

use crate::aggregator::{self, Aggregate};
use crate::ports::{
    AttemptTransition, ChannelSender, IdempotencyLocks, LockToken, MessageBus, NotificationStore,
    SaveOutcome,
};
use crate::retry::RetryPolicy;

const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;
const MAX_RECIPIENT_ID_LEN: usize = 256;
const MAX_CONTENT_BYTES: usize = 64 * 1024;

/// How long a submission waits for a concurrent holder of the same key.
const MAX_LOCK_WAIT: Duration = Duration::from_secs(2);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Optimistic status writes retried this many times before giving up.
const STATUS_WRITE_RETRIES: usize = 8;

/// What happened to a task handed to [`DispatchService::on_task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Delivered,
    Retrying { next_attempt: u32, delay: Duration },
    Failed,
    /// Already claimed, cancelled or superseded; nothing was sent.
    Skipped,
}

/// State of the dedup lock taken for a keyed submission.
enum DedupLock {
    Held(LockToken),
    NotHeld,
}

pub struct DispatchService {
    store: Arc<dyn NotificationStore>,
    locks: Arc<dyn IdempotencyLocks>,
    bus: Arc<dyn MessageBus>,
    policy: RetryPolicy,
    lock_ttl: Duration,
}

impl DispatchService {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        locks: Arc<dyn IdempotencyLocks>,
        bus: Arc<dyn MessageBus>,
        policy: RetryPolicy,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            store,
            locks,
            bus,
            policy,
            lock_ttl,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<dyn NotificationStore> {
        &self.store
    }

    /// Validate a submission without touching any store.
    pub fn validate(request: &SubmitRequest) -> Result<(), DispatchError> {
        let recipient_id = request.recipient.id.trim();
        if recipient_id.is_empty() {
            return Err(DispatchError::Validation(
                "recipient.id must not be empty".to_string(),
            ));
        }
        if recipient_id.len() > MAX_RECIPIENT_ID_LEN {
            return Err(DispatchError::Validation(format!(
                "recipient.id exceeds {} bytes",
                MAX_RECIPIENT_ID_LEN
            )));
        }

        if request.channels.is_empty() {
            return Err(DispatchError::Validation(
                "at least one channel is required".to_string(),
            ));
        }

        if request.channels.contains(&ChannelKind::Email) {
            let valid = request
                .recipient
                .email
                .as_deref()
                .map(|e| {
                    let e = e.trim();
                    e.len() > 2 && e.contains('@') && !e.starts_with('@') && !e.ends_with('@')
                })
                .unwrap_or(false);
            if !valid {
                return Err(DispatchError::Validation(
                    "email channel requires a valid recipient.email".to_string(),
                ));
            }
        }

        if request.payload.content.is_null() {
            return Err(DispatchError::Validation(
                "payload.content must not be null".to_string(),
            ));
        }
        if let Some(template) = &request.payload.template
            && template.trim().is_empty()
        {
            return Err(DispatchError::Validation(
                "payload.template must not be blank".to_string(),
            ));
        }
        let size = serde_json::to_vec(&request.payload.content)
            .map(|b| b.len())
            .unwrap_or(usize::MAX);
        if size > MAX_CONTENT_BYTES {
            return Err(DispatchError::Validation(format!(
                "payload.content exceeds {} bytes",
                MAX_CONTENT_BYTES
            )));
        }

        if let Some(key) = &request.idempotency_key
            && (key.trim().is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN)
        {
            return Err(DispatchError::Validation(format!(
                "idempotency_key must be 1..={} bytes",
                MAX_IDEMPOTENCY_KEY_LEN
            )));
        }

        Ok(())
    }

    /// Accept a notification for asynchronous delivery and return its id.
    ///
    /// A keyed submission that matches an existing notification fails with
    /// `DuplicateSubmission` carrying the existing id.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Uuid, DispatchError> {
        Self::validate(&request)?;

        let key = request.idempotency_key.clone();
        let lock = match &key {
            Some(key) => self.acquire_dedup(key).await?,
            None => DedupLock::NotHeld,
        };

        let result = self.persist_and_publish(request).await;

        if let (DedupLock::Held(token), Some(key)) = (&lock, &key)
            && let Err(e) = self.locks.release(key, token).await
        {
            tracing::warn!(error = %e, "Failed to release idempotency lock");
        }

        result
    }

    /// Take the short-lived dedup lock for `key`.
    ///
    /// When another submission holds it, wait briefly for that submission to
    /// land and report it as the duplicate. A cache outage only degrades dedup
    /// to the store's unique key.
    async fn acquire_dedup(&self, key: &str) -> Result<DedupLock, DispatchError> {
        match self.locks.try_acquire(key, self.lock_ttl).await {
            Ok(Some(token)) => Ok(DedupLock::Held(token)),
            Ok(None) => {
                let deadline = tokio::time::Instant::now() + self.lock_ttl.min(MAX_LOCK_WAIT);
                loop {
                    if let Some(existing) = self.store.find_by_idempotency_key(key).await? {
                        return Err(DispatchError::DuplicateSubmission {
                            existing_id: existing.id,
                        });
                    }
                    if tokio::time::Instant::now() >= deadline {
                        tracing::debug!("Idempotency lock still held, falling back to store check");
                        return Ok(DedupLock::NotHeld);
                    }
                    tokio::time::sleep(LOCK_POLL_INTERVAL).await;
                }
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Cache unavailable, idempotency dedup degraded to store check"
                );
                Ok(DedupLock::NotHeld)
            }
        }
    }

    async fn persist_and_publish(&self, request: SubmitRequest) -> Result<Uuid, DispatchError> {
        if let Some(key) = &request.idempotency_key
            && let Some(existing) = self.store.find_by_idempotency_key(key).await?
        {
            return Err(DispatchError::DuplicateSubmission {
                existing_id: existing.id,
            });
        }

        let notification = Notification::new(request, Utc::now());
        let attempts = notification.initial_attempts();

        if let SaveOutcome::DuplicateKey { existing_id } =
            self.store.save(&notification, &attempts).await?
        {
            return Err(DispatchError::DuplicateSubmission { existing_id });
        }

        for attempt in &attempts {
            self.bus
                .publish(
                    &DispatchTask::for_attempt(attempt, notification.priority),
                    None,
                )
                .await?;
        }

        tracing::info!(
            notification_id = %notification.id,
            recipient = %notification.recipient.id,
            channels = notification.channels.len(),
            priority = %notification.priority,
            "Notification accepted"
        );

        Ok(notification.id)
    }

    /// Claim a task's attempt (`queued -> sending`).
    ///
    /// `false` means the attempt was already claimed, cancelled or superseded,
    /// which is how duplicate bus deliveries are dropped.
    pub async fn claim(&self, task: &DispatchTask) -> Result<bool, DispatchError> {
        let change = AttemptTransition::new(
            task.notification_id,
            task.channel,
            task.attempt_number,
            ChannelState::Queued,
            ChannelState::Sending,
        )?;
        Ok(self.store.transition_attempt(&change).await?)
    }

    /// Bus consumer callback: claim, send, record.
    pub async fn on_task(
        &self,
        task: &DispatchTask,
        sender: &dyn ChannelSender,
    ) -> Result<TaskOutcome, DispatchError> {
        if !self.claim(task).await? {
            tracing::debug!(
                notification_id = %task.notification_id,
                channel = %task.channel,
                attempt = task.attempt_number,
                "Task skipped, attempt no longer queued"
            );
            // A redelivered task may be all that is left of a run whose final
            // status write failed.
            match self.refresh_status(task.notification_id).await {
                Ok(_) | Err(DispatchError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
            return Ok(TaskOutcome::Skipped);
        }

        let notification = self
            .store
            .find_by_id(task.notification_id)
            .await?
            .ok_or(DispatchError::NotFound(task.notification_id))?;
        self.refresh_status(notification.id).await?;

        let result = sender.send(&notification).await;

        self.report_outcome(
            task.notification_id,
            task.channel,
            task.attempt_number,
            result,
        )
        .await
    }

    /// Record the outcome of a `sending` attempt and recompute the aggregate status.
    ///
    /// Transient failures below the ceiling append attempt `n + 1` and publish
    /// it with backoff; at the ceiling the channel becomes `failed_terminal`.
    pub async fn report_outcome(
        &self,
        notification_id: Uuid,
        channel: ChannelKind,
        attempt_number: u32,
        result: Result<(), ChannelError>,
    ) -> Result<TaskOutcome, DispatchError> {
        let notification = self
            .store
            .find_by_id(notification_id)
            .await?
            .ok_or(DispatchError::NotFound(notification_id))?;

        let transition = |from, to| {
            AttemptTransition::new(notification_id, channel, attempt_number, from, to)
        };

        let outcome = match result {
            Ok(()) => {
                let change = transition(ChannelState::Sending, ChannelState::Sent)?;
                if !self.apply(&change).await? {
                    return Ok(TaskOutcome::Skipped);
                }
                tracing::info!(
                    notification_id = %notification_id,
                    channel = %channel,
                    attempt = attempt_number,
                    "Delivered"
                );
                TaskOutcome::Delivered
            }
            Err(ChannelError::Terminal(detail)) => {
                let change = transition(ChannelState::Sending, ChannelState::FailedTerminal)?
                    .with_error(detail.clone());
                if !self.apply(&change).await? {
                    return Ok(TaskOutcome::Skipped);
                }
                tracing::warn!(
                    notification_id = %notification_id,
                    channel = %channel,
                    attempt = attempt_number,
                    error = %detail,
                    "Delivery failed permanently"
                );
                TaskOutcome::Failed
            }
            Err(ChannelError::Transient(detail)) => {
                let change = transition(ChannelState::Sending, ChannelState::FailedTransient)?
                    .with_error(detail.clone());
                if !self.apply(&change).await? {
                    return Ok(TaskOutcome::Skipped);
                }
                self.retry_or_give_up(&notification, channel, attempt_number, &detail)
                    .await?
            }
        };

        self.refresh_status(notification_id).await?;
        Ok(outcome)
    }

    /// Move a channel whose worker never finished its attempt forward.
    ///
    /// A `sending` attempt is failed transiently first; a `failed_transient`
    /// attempt without a successor goes straight to the retry decision. Either
    /// way the channel ends up queued again or terminal.
    pub async fn recover_stalled(
        &self,
        attempt: &DeliveryAttempt,
    ) -> Result<TaskOutcome, DispatchError> {
        let notification = self
            .store
            .find_by_id(attempt.notification_id)
            .await?
            .ok_or(DispatchError::NotFound(attempt.notification_id))?;

        let detail = match attempt.state {
            ChannelState::Sending => {
                let detail = "delivery lease expired before an outcome was recorded".to_string();
                let change = AttemptTransition::new(
                    attempt.notification_id,
                    attempt.channel,
                    attempt.attempt_number,
                    ChannelState::Sending,
                    ChannelState::FailedTransient,
                )?
                .with_error(detail.clone());
                if !self.apply(&change).await? {
                    return Ok(TaskOutcome::Skipped);
                }
                detail
            }
            ChannelState::FailedTransient => attempt
                .error_detail
                .clone()
                .unwrap_or_else(|| "transient failure".to_string()),
            _ => return Ok(TaskOutcome::Skipped),
        };

        tracing::warn!(
            notification_id = %attempt.notification_id,
            channel = %attempt.channel,
            attempt = attempt.attempt_number,
            state = %attempt.state,
            "Recovering stalled attempt"
        );

        let outcome = self
            .retry_or_give_up(&notification, attempt.channel, attempt.attempt_number, &detail)
            .await?;
        self.refresh_status(notification.id).await?;
        Ok(outcome)
    }

    /// Publish a task for a `queued` attempt whose bus message went missing.
    ///
    /// Returns `false` when the notification no longer exists.
    pub async fn republish(&self, attempt: &DeliveryAttempt) -> Result<bool, DispatchError> {
        let Some(notification) = self.store.find_by_id(attempt.notification_id).await? else {
            return Ok(false);
        };
        self.bus
            .publish(
                &DispatchTask::for_attempt(attempt, notification.priority),
                None,
            )
            .await?;
        Ok(true)
    }

    /// After a `failed_transient` attempt: append attempt `n + 1`, or give the
    /// channel up once the ceiling is reached.
    async fn retry_or_give_up(
        &self,
        notification: &Notification,
        channel: ChannelKind,
        attempt_number: u32,
        detail: &str,
    ) -> Result<TaskOutcome, DispatchError> {
        if self.policy.should_retry(attempt_number) {
            return self
                .schedule_retry(notification, channel, attempt_number, detail)
                .await;
        }

        let change = AttemptTransition::new(
            notification.id,
            channel,
            attempt_number,
            ChannelState::FailedTransient,
            ChannelState::FailedTerminal,
        )?
        .with_error(format!(
            "gave up after {} attempts: {}",
            attempt_number, detail
        ));
        if !self.apply(&change).await? {
            return Ok(TaskOutcome::Skipped);
        }
        tracing::warn!(
            notification_id = %notification.id,
            channel = %channel,
            attempts = attempt_number,
            error = %detail,
            "Retry ceiling reached"
        );
        Ok(TaskOutcome::Failed)
    }

    async fn schedule_retry(
        &self,
        notification: &Notification,
        channel: ChannelKind,
        attempt_number: u32,
        detail: &str,
    ) -> Result<TaskOutcome, DispatchError> {
        let next = DeliveryAttempt::queued(notification.id, channel, attempt_number + 1, Utc::now());
        if !self.store.append_attempt(&next, attempt_number).await? {
            tracing::warn!(
                notification_id = %notification.id,
                channel = %channel,
                attempt = next.attempt_number,
                "Retry already scheduled by another worker"
            );
            return Ok(TaskOutcome::Skipped);
        }

        let delay = self.policy.delay_after(attempt_number);
        self.bus
            .publish(
                &DispatchTask::for_attempt(&next, notification.priority),
                Some(delay),
            )
            .await?;

        tracing::info!(
            notification_id = %notification.id,
            channel = %channel,
            next_attempt = next.attempt_number,
            delay_ms = delay.as_millis() as u64,
            error = %detail,
            "Retry scheduled"
        );

        Ok(TaskOutcome::Retrying {
            next_attempt: next.attempt_number,
            delay,
        })
    }

    async fn apply(&self, change: &AttemptTransition) -> Result<bool, DispatchError> {
        let applied = self.store.transition_attempt(change).await?;
        if !applied {
            tracing::warn!(
                notification_id = %change.notification_id,
                channel = %change.channel,
                attempt = change.attempt_number,
                from = %change.from,
                to = %change.to,
                "Outcome ignored, attempt is not in the expected state"
            );
        }
        Ok(applied)
    }

    /// Recompute the aggregate status from the attempt history and record it.
    ///
    /// The write is conditional on the notification version read alongside
    /// the attempts, so a stale aggregate never overwrites a newer one.
    pub async fn refresh_status(&self, notification_id: Uuid) -> Result<Aggregate, DispatchError> {
        let mut last = None;

        for _ in 0..STATUS_WRITE_RETRIES {
            let notification = self
                .store
                .find_by_id(notification_id)
                .await?
                .ok_or(DispatchError::NotFound(notification_id))?;
            let attempts = self.store.attempts(notification_id).await?;
            let agg = aggregator::aggregate(&notification.channels, &attempts);

            if notification.status == agg.status && notification.settled_at.is_some() == agg.settled
            {
                return Ok(agg);
            }
            if self
                .store
                .record_status(notification_id, agg.status, agg.settled, notification.version)
                .await?
            {
                tracing::debug!(
                    notification_id = %notification_id,
                    status = %agg.status,
                    settled = agg.settled,
                    "Status updated"
                );
                return Ok(agg);
            }
            last = Some(agg);
        }

        tracing::warn!(
            notification_id = %notification_id,
            "Status write kept conflicting, leaving it to the next update"
        );
        last.ok_or(DispatchError::NotFound(notification_id))
    }

    /// Cancel every channel still waiting for its first attempt.
    ///
    /// Channels that already started sending are left to finish.
    pub async fn cancel(&self, notification_id: Uuid) -> Result<StatusReport, DispatchError> {
        let notification = self
            .store
            .find_by_id(notification_id)
            .await?
            .ok_or(DispatchError::NotFound(notification_id))?;
        let attempts = self.store.attempts(notification_id).await?;

        let mut cancelled = 0usize;
        for attempt in aggregator::latest_attempts(&attempts).values() {
            if attempt.state != ChannelState::Queued || attempt.attempt_number != 1 {
                continue;
            }
            let change = AttemptTransition::new(
                notification_id,
                attempt.channel,
                attempt.attempt_number,
                ChannelState::Queued,
                ChannelState::Cancelled,
            )?;
            if self.store.transition_attempt(&change).await? {
                cancelled += 1;
            }
        }

        if cancelled == 0 {
            return Err(DispatchError::NotCancellable(notification_id));
        }

        self.store.mark_cancelled(notification_id, Utc::now()).await?;
        self.refresh_status(notification_id).await?;

        tracing::info!(
            notification_id = %notification_id,
            cancelled_channels = cancelled,
            total_channels = notification.channels.len(),
            "Notification cancelled"
        );

        self.status(notification_id).await
    }

    /// Current delivery status, recomputed from the attempt history.
    pub async fn status(&self, notification_id: Uuid) -> Result<StatusReport, DispatchError> {
        let notification = self
            .store
            .find_by_id(notification_id)
            .await?
            .ok_or(DispatchError::NotFound(notification_id))?;
        let attempts = self.store.attempts(notification_id).await?;
        Ok(aggregator::report(&notification, &attempts))
    }
}
