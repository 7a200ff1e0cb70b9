//! In-memory adapters for every port.
//!
//! Used by the test suites and for running the engine without Postgres or
//! Redis. Each adapter can be switched to "unavailable" to exercise the
//! failure paths, and the store can fail single named operations.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use courier_common::error::{AppError, ChannelError};
use courier_common::types::{
    ChannelKind, ChannelState, DeliveryAttempt, DispatchTask, InboxCursor, Notification,
    NotificationStatus,
};

use crate::aggregator;
use crate::ports::{
    AttemptTransition, ChannelSender, Delivery, IdempotencyLocks, LockToken, MessageBus,
    NotificationStore, SaveOutcome,
};

fn unavailable(what: &str) -> AppError {
    AppError::Internal(format!("{} unavailable", what))
}

#[derive(Default)]
struct StoreInner {
    notifications: HashMap<Uuid, Notification>,
    keys: HashMap<String, Uuid>,
    attempts: HashMap<(Uuid, ChannelKind), Vec<DeliveryAttempt>>,
}

impl StoreInner {
    fn bump_version(&mut self, id: Uuid) {
        if let Some(n) = self.notifications.get_mut(&id) {
            n.version += 1;
        }
    }
}

/// `NotificationStore` backed by a mutex-guarded map.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
    unavailable: AtomicBool,
    fail_once: std::sync::Mutex<HashSet<&'static str>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    /// Make the next call of the named port operation (e.g. `"find_by_id"`) fail.
    pub fn fail_next(&self, operation: &'static str) {
        match self.fail_once.lock() {
            Ok(mut ops) => ops.insert(operation),
            Err(poisoned) => poisoned.into_inner().insert(operation),
        };
    }

    fn check(&self, operation: &'static str) -> Result<(), AppError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(unavailable("store"));
        }
        let tripped = match self.fail_once.lock() {
            Ok(mut ops) => ops.remove(operation),
            Err(poisoned) => poisoned.into_inner().remove(operation),
        };
        if tripped {
            return Err(unavailable("store"));
        }
        Ok(())
    }

    pub async fn notification_count(&self) -> usize {
        self.inner.lock().await.notifications.len()
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn save(
        &self,
        notification: &Notification,
        attempts: &[DeliveryAttempt],
    ) -> Result<SaveOutcome, AppError> {
        self.check("save")?;
        let mut inner = self.inner.lock().await;

        if let Some(key) = &notification.idempotency_key {
            if let Some(existing_id) = inner.keys.get(key) {
                return Ok(SaveOutcome::DuplicateKey {
                    existing_id: *existing_id,
                });
            }
            inner.keys.insert(key.clone(), notification.id);
        }

        inner
            .notifications
            .insert(notification.id, notification.clone());
        for attempt in attempts {
            inner
                .attempts
                .entry((attempt.notification_id, attempt.channel))
                .or_default()
                .push(attempt.clone());
        }

        Ok(SaveOutcome::Inserted)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Notification>, AppError> {
        self.check("find_by_id")?;
        Ok(self.inner.lock().await.notifications.get(&id).cloned())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Notification>, AppError> {
        self.check("find_by_idempotency_key")?;
        let inner = self.inner.lock().await;
        Ok(inner
            .keys
            .get(key)
            .and_then(|id| inner.notifications.get(id))
            .cloned())
    }

    async fn attempts(&self, id: Uuid) -> Result<Vec<DeliveryAttempt>, AppError> {
        self.check("attempts")?;
        let inner = self.inner.lock().await;
        let mut attempts: Vec<DeliveryAttempt> = inner
            .attempts
            .iter()
            .filter(|((nid, _), _)| *nid == id)
            .flat_map(|(_, list)| list.iter().cloned())
            .collect();
        attempts.sort_by_key(|a| (a.channel, a.attempt_number));
        Ok(attempts)
    }

    async fn append_attempt(
        &self,
        attempt: &DeliveryAttempt,
        expected_prior: u32,
    ) -> Result<bool, AppError> {
        self.check("append_attempt")?;
        let mut inner = self.inner.lock().await;
        if !inner.notifications.contains_key(&attempt.notification_id) {
            return Ok(false);
        }

        let list = inner
            .attempts
            .entry((attempt.notification_id, attempt.channel))
            .or_default();
        let latest = list.last().map(|a| a.attempt_number).unwrap_or(0);
        if latest != expected_prior || attempt.attempt_number != expected_prior + 1 {
            return Ok(false);
        }
        list.push(attempt.clone());
        inner.bump_version(attempt.notification_id);
        Ok(true)
    }

    async fn transition_attempt(&self, change: &AttemptTransition) -> Result<bool, AppError> {
        self.check("transition_attempt")?;
        let mut inner = self.inner.lock().await;
        let Some(list) = inner
            .attempts
            .get_mut(&(change.notification_id, change.channel))
        else {
            return Ok(false);
        };
        let Some(attempt) = list
            .iter_mut()
            .find(|a| a.attempt_number == change.attempt_number)
        else {
            return Ok(false);
        };
        if attempt.state != change.from {
            return Ok(false);
        }

        attempt.state = change.to;
        attempt.updated_at = change.at;
        if change.error_detail.is_some() {
            attempt.error_detail = change.error_detail.clone();
        }
        inner.bump_version(change.notification_id);
        Ok(true)
    }

    async fn record_status(
        &self,
        id: Uuid,
        status: NotificationStatus,
        settled: bool,
        expected_version: i64,
    ) -> Result<bool, AppError> {
        self.check("record_status")?;
        let mut inner = self.inner.lock().await;
        let Some(n) = inner.notifications.get_mut(&id) else {
            return Ok(false);
        };
        if n.version != expected_version {
            return Ok(false);
        }
        n.status = status;
        n.settled_at = if settled {
            n.settled_at.or_else(|| Some(Utc::now()))
        } else {
            None
        };
        Ok(true)
    }

    async fn mark_cancelled(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), AppError> {
        self.check("mark_cancelled")?;
        if let Some(n) = self.inner.lock().await.notifications.get_mut(&id) {
            n.cancelled_at.get_or_insert(at);
        }
        Ok(())
    }

    async fn list_for_recipient(
        &self,
        recipient_id: &str,
        cursor: Option<InboxCursor>,
        limit: usize,
        unread_only: bool,
    ) -> Result<Vec<Notification>, AppError> {
        self.check("list_for_recipient")?;
        let inner = self.inner.lock().await;
        let mut rows: Vec<Notification> = inner
            .notifications
            .values()
            .filter(|n| n.recipient.id == recipient_id)
            .filter(|n| n.archived_at.is_none() && n.dismissed_at.is_none())
            .filter(|n| !unread_only || n.read_at.is_none())
            .filter(|n| match cursor {
                Some(c) => (n.created_at, n.id) < (c.created_at, c.id),
                None => true,
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        rows.truncate(limit + 1);
        Ok(rows)
    }

    async fn mark_read(&self, id: Uuid, recipient_id: &str) -> Result<bool, AppError> {
        self.check("mark_read")?;
        let mut inner = self.inner.lock().await;
        match inner.notifications.get_mut(&id) {
            Some(n) if n.recipient.id == recipient_id => {
                n.read_at.get_or_insert_with(Utc::now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_all_read(&self, recipient_id: &str) -> Result<u64, AppError> {
        self.check("mark_all_read")?;
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut updated = 0;
        for n in inner.notifications.values_mut() {
            if n.recipient.id == recipient_id && n.read_at.is_none() && n.archived_at.is_none() {
                n.read_at = Some(now);
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn dismiss(&self, id: Uuid, recipient_id: &str) -> Result<bool, AppError> {
        self.check("dismiss")?;
        let mut inner = self.inner.lock().await;
        match inner.notifications.get_mut(&id) {
            Some(n) if n.recipient.id == recipient_id && n.archived_at.is_none() => {
                n.dismissed_at.get_or_insert_with(Utc::now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn dismiss_all(&self, recipient_id: &str) -> Result<u64, AppError> {
        self.check("dismiss_all")?;
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut updated = 0;
        for n in inner.notifications.values_mut() {
            if n.recipient.id == recipient_id && n.dismissed_at.is_none() && n.archived_at.is_none()
            {
                n.dismissed_at = Some(now);
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn requeue_stale(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryAttempt>, AppError> {
        self.check("requeue_stale")?;
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let mut stale = Vec::new();
        for ((id, _), list) in inner.attempts.iter_mut() {
            if stale.len() >= limit {
                break;
            }
            let archived = inner
                .notifications
                .get(id)
                .map(|n| n.archived_at.is_some())
                .unwrap_or(true);
            if archived {
                continue;
            }
            if let Some(latest) = list.last_mut()
                && latest.state == ChannelState::Queued
                && latest.updated_at < older_than
            {
                latest.updated_at = now;
                stale.push(latest.clone());
            }
        }
        Ok(stale)
    }

    async fn stalled_attempts(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryAttempt>, AppError> {
        self.check("stalled_attempts")?;
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let mut stalled = Vec::new();
        for ((id, _), list) in inner.attempts.iter_mut() {
            if stalled.len() >= limit {
                break;
            }
            let archived = inner
                .notifications
                .get(id)
                .map(|n| n.archived_at.is_some())
                .unwrap_or(true);
            if archived {
                continue;
            }
            if let Some(latest) = list.last_mut()
                && matches!(
                    latest.state,
                    ChannelState::Sending | ChannelState::FailedTransient
                )
                && latest.updated_at < older_than
            {
                latest.updated_at = now;
                stalled.push(latest.clone());
            }
        }
        Ok(stalled)
    }

    async fn finished_unsettled(&self, limit: usize) -> Result<Vec<Uuid>, AppError> {
        self.check("finished_unsettled")?;
        let inner = self.inner.lock().await;
        let mut candidates: Vec<&Notification> = inner
            .notifications
            .values()
            .filter(|n| n.settled_at.is_none() && n.archived_at.is_none())
            .filter(|n| {
                let attempts: Vec<DeliveryAttempt> = n
                    .channels
                    .iter()
                    .filter_map(|c| inner.attempts.get(&(n.id, *c)))
                    .flat_map(|list| list.iter().cloned())
                    .collect();
                aggregator::aggregate(&n.channels, &attempts).settled
            })
            .collect();
        candidates.sort_by_key(|n| n.created_at);
        Ok(candidates.into_iter().take(limit).map(|n| n.id).collect())
    }

    async fn archive_settled(&self, settled_before: DateTime<Utc>) -> Result<u64, AppError> {
        self.check("archive_settled")?;
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut archived = 0;
        for n in inner.notifications.values_mut() {
            if n.archived_at.is_none() && n.settled_at.is_some_and(|at| at < settled_before) {
                n.archived_at = Some(now);
                archived += 1;
            }
        }
        Ok(archived)
    }
}

/// `IdempotencyLocks` with TTL expiry measured on the tokio clock.
#[derive(Default)]
pub struct MemoryLocks {
    held: Mutex<HashMap<String, (LockToken, Instant)>>,
    unavailable: AtomicBool,
}

impl MemoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl IdempotencyLocks for MemoryLocks {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>, AppError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(unavailable("cache"));
        }
        let mut held = self.held.lock().await;
        let now = Instant::now();
        match held.get(key) {
            Some((_, expires)) if *expires > now => Ok(None),
            _ => {
                let token = LockToken::generate();
                held.insert(key.to_string(), (token.clone(), now + ttl));
                Ok(Some(token))
            }
        }
    }

    async fn release(&self, key: &str, token: &LockToken) -> Result<(), AppError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(unavailable("cache"));
        }
        let mut held = self.held.lock().await;
        if held.get(key).is_some_and(|(owner, _)| owner == token) {
            held.remove(key);
        }
        Ok(())
    }
}

struct Queued {
    ready_at: Instant,
    task: DispatchTask,
}

#[derive(Default)]
struct BusInner {
    queues: HashMap<ChannelKind, VecDeque<Queued>>,
    published: Vec<(DispatchTask, Option<Duration>)>,
    in_flight: usize,
}

/// `MessageBus` with per-channel queues; delayed tasks become visible once due
/// and keep their priority.
#[derive(Default)]
pub struct MemoryBus {
    inner: Mutex<BusInner>,
    unavailable: AtomicBool,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    /// Every publish so far, with its delay.
    pub async fn published(&self) -> Vec<(DispatchTask, Option<Duration>)> {
        self.inner.lock().await.published.clone()
    }

    /// Tasks queued (ready or delayed) plus tasks handed out but not acked.
    pub async fn outstanding(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.queues.values().map(VecDeque::len).sum::<usize>() + inner.in_flight
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, task: &DispatchTask, delay: Option<Duration>) -> Result<(), AppError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(unavailable("bus"));
        }
        let mut inner = self.inner.lock().await;
        inner.published.push((task.clone(), delay));

        let entry = Queued {
            ready_at: Instant::now() + delay.unwrap_or_default(),
            task: task.clone(),
        };
        inner.queues.entry(task.channel).or_default().push_back(entry);
        Ok(())
    }

    async fn next_task(&self, channel: ChannelKind) -> Result<Option<Delivery>, AppError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(unavailable("bus"));
        }
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let Some(queue) = inner.queues.get_mut(&channel) else {
            return Ok(None);
        };
        // Highest priority first, oldest first within a priority.
        let Some(pos) = queue
            .iter()
            .enumerate()
            .filter(|(_, q)| q.ready_at <= now)
            .min_by_key(|(i, q)| (Reverse(q.task.priority), *i))
            .map(|(i, _)| i)
        else {
            return Ok(None);
        };
        let Some(entry) = queue.remove(pos) else {
            return Ok(None);
        };
        inner.in_flight += 1;
        Ok(Some(Delivery {
            task: entry.task,
            receipt: String::new(),
        }))
    }

    async fn ack(&self, _delivery: &Delivery) -> Result<(), AppError> {
        let mut inner = self.inner.lock().await;
        inner.in_flight = inner.in_flight.saturating_sub(1);
        Ok(())
    }
}

/// Channel sender that replays a scripted sequence of results, then succeeds.
pub struct ScriptedSender {
    channel: ChannelKind,
    script: std::sync::Mutex<VecDeque<Result<(), ChannelError>>>,
    calls: AtomicU32,
}

impl ScriptedSender {
    pub fn new(channel: ChannelKind) -> Self {
        Self::with_script(channel, Vec::new())
    }

    pub fn with_script(channel: ChannelKind, script: Vec<Result<(), ChannelError>>) -> Self {
        Self {
            channel,
            script: std::sync::Mutex::new(script.into()),
            calls: AtomicU32::new(0),
        }
    }

    /// Fail transiently `n` times before succeeding.
    pub fn flaky(channel: ChannelKind, n: usize) -> Self {
        Self::with_script(
            channel,
            (0..n)
                .map(|i| Err(ChannelError::Transient(format!("flake #{}", i + 1))))
                .collect(),
        )
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelSender for ScriptedSender {
    fn channel(&self) -> ChannelKind {
        self.channel
    }

    async fn send(&self, _notification: &Notification) -> Result<(), ChannelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = match self.script.lock() {
            Ok(mut script) => script.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        };
        next.unwrap_or(Ok(()))
    }
}
