//! End-to-end dispatch scenarios against the in-memory adapters.
//!
//! ```bash
//! cargo test -p courier-engine --test integration
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use courier_common::error::{ChannelError, DispatchError};
use courier_common::types::{
    ChannelKind, ChannelState, NotificationPayload, NotificationStatus, Priority, Recipient,
    SubmitRequest,
};
use courier_engine::inbox::InboxService;
use courier_engine::memory::{MemoryBus, MemoryLocks, MemoryStore, ScriptedSender};
use courier_engine::ports::{ChannelSender, MessageBus, NotificationStore};
use courier_engine::retention::Sweeper;
use courier_engine::{DispatchService, RetryPolicy, TaskOutcome};

// ============================================================
// Shared helpers
// ============================================================

struct Harness {
    store: Arc<MemoryStore>,
    locks: Arc<MemoryLocks>,
    bus: Arc<MemoryBus>,
    service: Arc<DispatchService>,
}

/// Retries without backoff so scenarios run instantly.
fn instant_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        backoff_multiplier: 2.0,
    }
}

fn harness(policy: RetryPolicy) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let locks = Arc::new(MemoryLocks::new());
    let bus = Arc::new(MemoryBus::new());
    let service = Arc::new(DispatchService::new(
        store.clone(),
        locks.clone(),
        bus.clone(),
        policy,
        Duration::from_secs(30),
    ));
    Harness {
        store,
        locks,
        bus,
        service,
    }
}

fn request(recipient: &str, channels: &[ChannelKind]) -> SubmitRequest {
    SubmitRequest {
        recipient: Recipient {
            id: recipient.to_string(),
            email: Some(format!("{}@example.com", recipient)),
        },
        channels: channels.to_vec(),
        payload: NotificationPayload {
            template: None,
            content: serde_json::json!({"subject": "Order shipped", "body": "On its way"}),
        },
        priority: Priority::Normal,
        idempotency_key: None,
    }
}

fn keyed(recipient: &str, channels: &[ChannelKind], key: &str) -> SubmitRequest {
    SubmitRequest {
        idempotency_key: Some(key.to_string()),
        ..request(recipient, channels)
    }
}

/// Sweeper that republishes and recovers immediately but never archives.
fn eager_sweeper(h: &Harness) -> Sweeper {
    Sweeper::new(
        h.service.clone(),
        Duration::from_secs(60),
        Duration::from_secs(3600),
        Duration::ZERO,
        Duration::from_secs(3600),
    )
}

/// Consume every ready task until the bus is empty, like a worker pool would.
async fn drain(h: &Harness, senders: &[&ScriptedSender]) -> Vec<TaskOutcome> {
    let by_channel: HashMap<ChannelKind, &ScriptedSender> =
        senders.iter().map(|s| (s.channel(), *s)).collect();
    let mut outcomes = Vec::new();

    for _ in 0..100 {
        let mut progressed = false;
        for channel in ChannelKind::ALL {
            let Some(delivery) = h.bus.next_task(channel).await.unwrap() else {
                continue;
            };
            progressed = true;
            let sender = by_channel[&channel];
            outcomes.push(h.service.on_task(&delivery.task, sender).await.unwrap());
            h.bus.ack(&delivery).await.unwrap();
        }
        if !progressed {
            return outcomes;
        }
    }
    panic!("bus never drained");
}

// ============================================================
// Fan-out and retries
// ============================================================

#[tokio::test]
async fn test_transient_failures_retry_until_delivered() {
    let h = harness(instant_policy(5));
    let queue = ScriptedSender::new(ChannelKind::Queue);
    let push = ScriptedSender::flaky(ChannelKind::Push, 2);

    let id = h
        .service
        .submit(request("user-1", &[ChannelKind::Queue, ChannelKind::Push]))
        .await
        .unwrap();
    assert_eq!(
        h.service.status(id).await.unwrap().status,
        NotificationStatus::Pending
    );

    drain(&h, &[&queue, &push]).await;

    let report = h.service.status(id).await.unwrap();
    assert_eq!(report.status, NotificationStatus::Delivered);
    assert!(report.settled);
    assert_eq!(report.channel(ChannelKind::Push).unwrap().attempts, 3);
    assert_eq!(report.channel(ChannelKind::Queue).unwrap().attempts, 1);
    assert_eq!(push.calls(), 3);
    assert_eq!(queue.calls(), 1);

    let stored = h.store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.status, NotificationStatus::Delivered);
    assert!(stored.settled_at.is_some());
}

#[tokio::test]
async fn test_attempt_numbers_strictly_increase() {
    let h = harness(instant_policy(5));
    let push = ScriptedSender::flaky(ChannelKind::Push, 3);

    let id = h
        .service
        .submit(request("user-1", &[ChannelKind::Push]))
        .await
        .unwrap();
    drain(&h, &[&push]).await;

    let attempts = h.store.attempts(id).await.unwrap();
    let numbers: Vec<u32> = attempts.iter().map(|a| a.attempt_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4]);

    let states: Vec<ChannelState> = attempts.iter().map(|a| a.state).collect();
    assert_eq!(
        states,
        vec![
            ChannelState::FailedTransient,
            ChannelState::FailedTransient,
            ChannelState::FailedTransient,
            ChannelState::Sent,
        ]
    );
    assert_eq!(attempts[0].error_detail.as_deref(), Some("flake #1"));
}

#[tokio::test]
async fn test_success_on_last_allowed_attempt() {
    let h = harness(instant_policy(3));
    let push = ScriptedSender::flaky(ChannelKind::Push, 2);

    let id = h
        .service
        .submit(request("user-1", &[ChannelKind::Push]))
        .await
        .unwrap();
    drain(&h, &[&push]).await;

    let report = h.service.status(id).await.unwrap();
    assert_eq!(report.channel(ChannelKind::Push).unwrap().state, ChannelState::Sent);
    assert_eq!(report.status, NotificationStatus::Delivered);
}

#[tokio::test]
async fn test_retry_ceiling_marks_channel_failed() {
    let h = harness(instant_policy(3));
    let push = ScriptedSender::flaky(ChannelKind::Push, 3);

    let id = h
        .service
        .submit(request("user-1", &[ChannelKind::Push]))
        .await
        .unwrap();
    let outcomes = drain(&h, &[&push]).await;
    assert_eq!(outcomes.last(), Some(&TaskOutcome::Failed));

    let report = h.service.status(id).await.unwrap();
    let push_report = report.channel(ChannelKind::Push).unwrap();
    assert_eq!(push_report.state, ChannelState::FailedTerminal);
    assert_eq!(push_report.attempts, 3);
    assert!(push_report.last_error.as_deref().unwrap().contains("gave up after 3"));
    assert_eq!(report.status, NotificationStatus::Failed);
    assert_eq!(push.calls(), 3);
}

#[tokio::test]
async fn test_terminal_error_is_not_retried() {
    let h = harness(instant_policy(5));
    let email = ScriptedSender::with_script(
        ChannelKind::Email,
        vec![Err(ChannelError::Terminal("mailbox does not exist".to_string()))],
    );
    let queue = ScriptedSender::new(ChannelKind::Queue);

    let id = h
        .service
        .submit(request("user-1", &[ChannelKind::Email, ChannelKind::Queue]))
        .await
        .unwrap();
    drain(&h, &[&email, &queue]).await;

    let report = h.service.status(id).await.unwrap();
    assert_eq!(email.calls(), 1);
    assert_eq!(
        report.channel(ChannelKind::Email).unwrap().state,
        ChannelState::FailedTerminal
    );
    assert_eq!(report.status, NotificationStatus::PartiallyFailed);
    assert!(report.settled);
}

#[tokio::test]
async fn test_retry_published_with_backoff() {
    let h = harness(RetryPolicy::default());
    let push = ScriptedSender::flaky(ChannelKind::Push, 1);

    let id = h
        .service
        .submit(request("user-1", &[ChannelKind::Push]))
        .await
        .unwrap();
    let delivery = h.bus.next_task(ChannelKind::Push).await.unwrap().unwrap();
    let outcome = h.service.on_task(&delivery.task, &push).await.unwrap();
    h.bus.ack(&delivery).await.unwrap();

    assert_eq!(
        outcome,
        TaskOutcome::Retrying {
            next_attempt: 2,
            delay: Duration::from_secs(1)
        }
    );

    let published = h.bus.published().await;
    let (retry, delay) = published.last().unwrap();
    assert_eq!(retry.notification_id, id);
    assert_eq!(retry.attempt_number, 2);
    assert_eq!(*delay, Some(Duration::from_secs(1)));

    // not visible until the backoff elapses
    assert!(h.bus.next_task(ChannelKind::Push).await.unwrap().is_none());
    assert_eq!(
        h.service.status(id).await.unwrap().status,
        NotificationStatus::InProgress
    );
}

#[tokio::test]
async fn test_duplicate_task_delivery_is_skipped() {
    let h = harness(instant_policy(5));
    let push = ScriptedSender::new(ChannelKind::Push);

    h.service
        .submit(request("user-1", &[ChannelKind::Push]))
        .await
        .unwrap();
    let delivery = h.bus.next_task(ChannelKind::Push).await.unwrap().unwrap();
    // at-least-once bus: the same task shows up again
    h.bus.publish(&delivery.task, None).await.unwrap();

    let first = h.service.on_task(&delivery.task, &push).await.unwrap();
    assert_eq!(first, TaskOutcome::Delivered);
    h.bus.ack(&delivery).await.unwrap();

    let outcomes = drain(&h, &[&push]).await;
    assert_eq!(outcomes, vec![TaskOutcome::Skipped]);
    assert_eq!(push.calls(), 1);
    assert_eq!(h.bus.outstanding().await, 0);
}

#[tokio::test]
async fn test_high_priority_jumps_the_queue() {
    let h = harness(instant_policy(5));

    let normal = h
        .service
        .submit(request("user-1", &[ChannelKind::Push]))
        .await
        .unwrap();
    let urgent = h
        .service
        .submit(SubmitRequest {
            priority: Priority::High,
            ..request("user-2", &[ChannelKind::Push])
        })
        .await
        .unwrap();

    let first = h.bus.next_task(ChannelKind::Push).await.unwrap().unwrap();
    let second = h.bus.next_task(ChannelKind::Push).await.unwrap().unwrap();
    assert_eq!(first.task.notification_id, urgent);
    assert_eq!(second.task.notification_id, normal);
}

#[tokio::test]
async fn test_low_priority_waits_behind_normal() {
    let h = harness(instant_policy(5));

    let low = h
        .service
        .submit(SubmitRequest {
            priority: Priority::Low,
            ..request("user-1", &[ChannelKind::Push])
        })
        .await
        .unwrap();
    let normal = h
        .service
        .submit(request("user-2", &[ChannelKind::Push]))
        .await
        .unwrap();

    let first = h.bus.next_task(ChannelKind::Push).await.unwrap().unwrap();
    let second = h.bus.next_task(ChannelKind::Push).await.unwrap().unwrap();
    assert_eq!(first.task.notification_id, normal);
    assert_eq!(second.task.notification_id, low);
}

#[tokio::test]
async fn test_retry_keeps_high_priority() {
    let h = harness(instant_policy(5));
    let push = ScriptedSender::flaky(ChannelKind::Push, 1);

    let normal = h
        .service
        .submit(request("user-1", &[ChannelKind::Push]))
        .await
        .unwrap();
    let urgent = h
        .service
        .submit(SubmitRequest {
            priority: Priority::High,
            ..request("user-2", &[ChannelKind::Push])
        })
        .await
        .unwrap();

    let delivery = h.bus.next_task(ChannelKind::Push).await.unwrap().unwrap();
    assert_eq!(delivery.task.notification_id, urgent);
    let outcome = h.service.on_task(&delivery.task, &push).await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Retrying { next_attempt: 2, .. }));
    h.bus.ack(&delivery).await.unwrap();

    // the delayed retry comes due ahead of the older normal task
    let retry = h.bus.next_task(ChannelKind::Push).await.unwrap().unwrap();
    assert_eq!(retry.task.notification_id, urgent);
    assert_eq!(retry.task.attempt_number, 2);
    assert_eq!(retry.task.priority, Priority::High);

    let last = h.bus.next_task(ChannelKind::Push).await.unwrap().unwrap();
    assert_eq!(last.task.notification_id, normal);
}

// ============================================================
// Concurrent outcomes
// ============================================================

#[tokio::test]
async fn test_concurrent_outcome_reports_schedule_one_retry() {
    let h = harness(instant_policy(5));

    let id = h
        .service
        .submit(request("user-1", &[ChannelKind::Push]))
        .await
        .unwrap();
    let delivery = h.bus.next_task(ChannelKind::Push).await.unwrap().unwrap();
    assert!(h.service.claim(&delivery.task).await.unwrap());

    let (a, b) = tokio::join!(
        h.service.report_outcome(
            id,
            ChannelKind::Push,
            1,
            Err(ChannelError::Transient("timeout".to_string()))
        ),
        h.service.report_outcome(
            id,
            ChannelKind::Push,
            1,
            Err(ChannelError::Transient("connection reset".to_string()))
        ),
    );
    let outcomes = [a.unwrap(), b.unwrap()];
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| matches!(o, TaskOutcome::Retrying { next_attempt: 2, .. }))
            .count(),
        1
    );
    assert_eq!(
        outcomes.iter().filter(|o| **o == TaskOutcome::Skipped).count(),
        1
    );

    let numbers: Vec<u32> = h
        .store
        .attempts(id)
        .await
        .unwrap()
        .iter()
        .map(|a| a.attempt_number)
        .collect();
    assert_eq!(numbers, vec![1, 2]);
    // the original task plus exactly one retry
    assert_eq!(h.bus.published().await.len(), 2);
}

#[tokio::test]
async fn test_concurrent_handling_of_duplicated_task_sends_once() {
    let h = harness(instant_policy(5));
    let push = ScriptedSender::new(ChannelKind::Push);

    let id = h
        .service
        .submit(request("user-1", &[ChannelKind::Push]))
        .await
        .unwrap();
    let delivery = h.bus.next_task(ChannelKind::Push).await.unwrap().unwrap();

    let (a, b) = tokio::join!(
        h.service.on_task(&delivery.task, &push),
        h.service.on_task(&delivery.task, &push),
    );
    let mut outcomes = vec![a.unwrap(), b.unwrap()];
    outcomes.sort_by_key(|o| *o == TaskOutcome::Skipped);
    assert_eq!(outcomes, vec![TaskOutcome::Delivered, TaskOutcome::Skipped]);
    assert_eq!(push.calls(), 1);
    assert_eq!(
        h.service.status(id).await.unwrap().status,
        NotificationStatus::Delivered
    );
}

#[tokio::test]
async fn test_recovery_racing_a_late_outcome_applies_once() {
    let h = harness(instant_policy(5));

    let id = h
        .service
        .submit(request("user-1", &[ChannelKind::Push]))
        .await
        .unwrap();
    let delivery = h.bus.next_task(ChannelKind::Push).await.unwrap().unwrap();
    assert!(h.service.claim(&delivery.task).await.unwrap());
    let sending = h.store.attempts(id).await.unwrap().remove(0);
    assert_eq!(sending.state, ChannelState::Sending);

    let (recovered, reported) = tokio::join!(
        h.service.recover_stalled(&sending),
        h.service.report_outcome(id, ChannelKind::Push, 1, Ok(())),
    );
    let (recovered, reported) = (recovered.unwrap(), reported.unwrap());

    let attempts = h.store.attempts(id).await.unwrap();
    match reported {
        TaskOutcome::Delivered => {
            assert_eq!(recovered, TaskOutcome::Skipped);
            assert_eq!(attempts.len(), 1);
            assert_eq!(attempts[0].state, ChannelState::Sent);
        }
        TaskOutcome::Skipped => {
            assert!(matches!(recovered, TaskOutcome::Retrying { next_attempt: 2, .. }));
            assert_eq!(attempts.len(), 2);
            assert_eq!(attempts[1].state, ChannelState::Queued);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

// ============================================================
// Idempotency
// ============================================================

#[tokio::test]
async fn test_concurrent_submissions_with_same_key() {
    let h = harness(instant_policy(5));

    let (a, b) = tokio::join!(
        h.service
            .submit(keyed("user-1", &[ChannelKind::Push], "order-1001")),
        h.service
            .submit(keyed("user-1", &[ChannelKind::Push], "order-1001")),
    );

    let (winner, loser) = match (a, b) {
        (Ok(id), Err(e)) | (Err(e), Ok(id)) => (id, e),
        other => panic!("expected exactly one acceptance, got {:?}", other),
    };
    assert_eq!(loser.existing_id(), Some(winner));
    assert_eq!(h.store.notification_count().await, 1);
    assert_eq!(h.bus.published().await.len(), 1);
}

#[tokio::test]
async fn test_sequential_resubmission_returns_existing_id() {
    let h = harness(instant_policy(5));

    let id = h
        .service
        .submit(keyed("user-1", &[ChannelKind::Email], "signup-7"))
        .await
        .unwrap();
    let err = h
        .service
        .submit(keyed("user-1", &[ChannelKind::Email], "signup-7"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DispatchError::DuplicateSubmission { existing_id } if existing_id == id
    ));
    assert_eq!(err.reason_code(), "duplicate_submission");
}

#[tokio::test]
async fn test_unkeyed_submissions_are_independent() {
    let h = harness(instant_policy(5));

    let a = h
        .service
        .submit(request("user-1", &[ChannelKind::Push]))
        .await
        .unwrap();
    let b = h
        .service
        .submit(request("user-1", &[ChannelKind::Push]))
        .await
        .unwrap();

    assert_ne!(a, b);
    assert_eq!(h.store.notification_count().await, 2);
}

#[tokio::test]
async fn test_cache_outage_degrades_to_store_dedup() {
    let h = harness(instant_policy(5));
    h.locks.set_unavailable(true);

    let id = h
        .service
        .submit(keyed("user-1", &[ChannelKind::Push], "k-1"))
        .await
        .unwrap();
    let err = h
        .service
        .submit(keyed("user-1", &[ChannelKind::Push], "k-1"))
        .await
        .unwrap_err();

    assert_eq!(err.existing_id(), Some(id));
    assert_eq!(h.store.notification_count().await, 1);
}

// ============================================================
// Failure surfaces
// ============================================================

#[tokio::test]
async fn test_validation_failure_persists_nothing() {
    let h = harness(instant_policy(5));

    let err = h
        .service
        .submit(request("user-1", &[]))
        .await
        .unwrap_err();

    assert_eq!(err.reason_code(), "validation_error");
    assert_eq!(h.store.notification_count().await, 0);
    assert!(h.bus.published().await.is_empty());
}

#[tokio::test]
async fn test_store_outage_surfaces_to_caller() {
    let h = harness(instant_policy(5));
    h.store.set_unavailable(true);

    let err = h
        .service
        .submit(request("user-1", &[ChannelKind::Push]))
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::InfrastructureUnavailable(_)));
    assert!(h.bus.published().await.is_empty());
}

#[tokio::test]
async fn test_unknown_notification() {
    let h = harness(instant_policy(5));
    let id = uuid::Uuid::new_v4();

    assert!(matches!(
        h.service.status(id).await,
        Err(DispatchError::NotFound(missing)) if missing == id
    ));
    assert!(matches!(
        h.service.cancel(id).await,
        Err(DispatchError::NotFound(_))
    ));
}

// ============================================================
// Cancellation
// ============================================================

#[tokio::test]
async fn test_cancel_before_any_claim() {
    let h = harness(instant_policy(5));
    let push = ScriptedSender::new(ChannelKind::Push);

    let id = h
        .service
        .submit(request("user-1", &[ChannelKind::Push]))
        .await
        .unwrap();
    let report = h.service.cancel(id).await.unwrap();
    assert_eq!(report.status, NotificationStatus::Cancelled);
    assert!(report.settled);

    let outcomes = drain(&h, &[&push]).await;
    assert_eq!(outcomes, vec![TaskOutcome::Skipped]);
    assert_eq!(push.calls(), 0);

    let stored = h.store.find_by_id(id).await.unwrap().unwrap();
    assert!(stored.cancelled_at.is_some());
}

#[tokio::test]
async fn test_cancel_leaves_claimed_channel_running() {
    let h = harness(instant_policy(5));
    let push = ScriptedSender::new(ChannelKind::Push);
    let queue = ScriptedSender::new(ChannelKind::Queue);

    let id = h
        .service
        .submit(request("user-1", &[ChannelKind::Push, ChannelKind::Queue]))
        .await
        .unwrap();

    let push_task = h.bus.next_task(ChannelKind::Push).await.unwrap().unwrap();
    assert!(h.service.claim(&push_task.task).await.unwrap());

    let report = h.service.cancel(id).await.unwrap();
    assert_eq!(
        report.channel(ChannelKind::Queue).unwrap().state,
        ChannelState::Cancelled
    );
    assert_eq!(
        report.channel(ChannelKind::Push).unwrap().state,
        ChannelState::Sending
    );
    assert_eq!(report.status, NotificationStatus::InProgress);

    let notification = h.store.find_by_id(id).await.unwrap().unwrap();
    let sent = push.send(&notification).await;
    let outcome = h
        .service
        .report_outcome(id, ChannelKind::Push, 1, sent)
        .await
        .unwrap();
    assert_eq!(outcome, TaskOutcome::Delivered);
    h.bus.ack(&push_task).await.unwrap();

    drain(&h, &[&push, &queue]).await;
    assert_eq!(queue.calls(), 0);

    let report = h.service.status(id).await.unwrap();
    assert_eq!(report.status, NotificationStatus::Cancelled);
    assert!(report.settled);
}

#[tokio::test]
async fn test_cancel_after_dispatch_started() {
    let h = harness(instant_policy(5));
    let push = ScriptedSender::new(ChannelKind::Push);

    let id = h
        .service
        .submit(request("user-1", &[ChannelKind::Push]))
        .await
        .unwrap();
    drain(&h, &[&push]).await;

    assert!(matches!(
        h.service.cancel(id).await,
        Err(DispatchError::NotCancellable(_))
    ));
}

#[tokio::test]
async fn test_retried_channel_cannot_be_cancelled() {
    let h = harness(RetryPolicy::default());
    let push = ScriptedSender::flaky(ChannelKind::Push, 1);

    let id = h
        .service
        .submit(request("user-1", &[ChannelKind::Push]))
        .await
        .unwrap();
    let delivery = h.bus.next_task(ChannelKind::Push).await.unwrap().unwrap();
    h.service.on_task(&delivery.task, &push).await.unwrap();

    // attempt #2 is queued but the channel has already started
    let err = h.service.cancel(id).await.unwrap_err();
    assert_eq!(err.reason_code(), "not_cancellable");
}

// ============================================================
// Reconciliation and retention
// ============================================================

#[tokio::test]
async fn test_sweeper_republishes_lost_task() {
    let h = harness(instant_policy(5));
    let push = ScriptedSender::new(ChannelKind::Push);

    h.bus.set_unavailable(true);
    let err = h
        .service
        .submit(request("user-1", &[ChannelKind::Push]))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::InfrastructureUnavailable(_)));
    h.bus.set_unavailable(false);
    assert_eq!(h.store.notification_count().await, 1);

    tokio::time::sleep(Duration::from_millis(5)).await;
    let sweeper = Sweeper::new(
        h.service.clone(),
        Duration::from_secs(60),
        Duration::ZERO,
        Duration::from_secs(3600),
        Duration::from_secs(3600),
    );
    let report = sweeper.sweep_once().await.unwrap();
    assert_eq!(report.republished, 1);
    assert_eq!(report.archived, 0);

    let outcomes = drain(&h, &[&push]).await;
    assert_eq!(outcomes, vec![TaskOutcome::Delivered]);
}

#[tokio::test]
async fn test_sweeper_recovers_attempt_stuck_in_sending() {
    let h = harness(instant_policy(5));
    let push = ScriptedSender::new(ChannelKind::Push);

    let id = h
        .service
        .submit(request("user-1", &[ChannelKind::Push]))
        .await
        .unwrap();
    let delivery = h.bus.next_task(ChannelKind::Push).await.unwrap().unwrap();

    // claimed, then the store drops out before anything was sent
    h.store.fail_next("find_by_id");
    let err = h.service.on_task(&delivery.task, &push).await.unwrap_err();
    assert!(matches!(err, DispatchError::InfrastructureUnavailable(_)));
    h.bus.ack(&delivery).await.unwrap();
    assert_eq!(
        h.store.attempts(id).await.unwrap()[0].state,
        ChannelState::Sending
    );

    tokio::time::sleep(Duration::from_millis(5)).await;
    let report = eager_sweeper(&h).sweep_once().await.unwrap();
    assert_eq!(report.recovered, 1);

    let outcomes = drain(&h, &[&push]).await;
    assert_eq!(outcomes, vec![TaskOutcome::Delivered]);

    let attempts = h.store.attempts(id).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].state, ChannelState::FailedTransient);
    assert!(attempts[0].error_detail.as_deref().unwrap().contains("lease expired"));
    assert_eq!(attempts[1].state, ChannelState::Sent);

    let stored = h.store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.status, NotificationStatus::Delivered);
    assert!(stored.settled_at.is_some());
}

#[tokio::test]
async fn test_sweeper_recovers_failed_attempt_without_successor() {
    let h = harness(instant_policy(5));
    let push = ScriptedSender::flaky(ChannelKind::Push, 1);

    let id = h
        .service
        .submit(request("user-1", &[ChannelKind::Push]))
        .await
        .unwrap();
    let delivery = h.bus.next_task(ChannelKind::Push).await.unwrap().unwrap();

    // the send fails transiently and the retry append is lost
    h.store.fail_next("append_attempt");
    assert!(h.service.on_task(&delivery.task, &push).await.is_err());
    h.bus.ack(&delivery).await.unwrap();
    let attempts = h.store.attempts(id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].state, ChannelState::FailedTransient);

    tokio::time::sleep(Duration::from_millis(5)).await;
    let report = eager_sweeper(&h).sweep_once().await.unwrap();
    assert_eq!(report.recovered, 1);

    drain(&h, &[&push]).await;
    let report = h.service.status(id).await.unwrap();
    assert_eq!(report.status, NotificationStatus::Delivered);
    assert_eq!(report.channel(ChannelKind::Push).unwrap().attempts, 2);
    assert_eq!(push.calls(), 2);
}

#[tokio::test]
async fn test_stalled_attempt_at_ceiling_fails_terminally() {
    let h = harness(instant_policy(1));
    let push = ScriptedSender::new(ChannelKind::Push);

    let id = h
        .service
        .submit(request("user-1", &[ChannelKind::Push]))
        .await
        .unwrap();
    let delivery = h.bus.next_task(ChannelKind::Push).await.unwrap().unwrap();
    h.store.fail_next("find_by_id");
    assert!(h.service.on_task(&delivery.task, &push).await.is_err());
    h.bus.ack(&delivery).await.unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    let report = eager_sweeper(&h).sweep_once().await.unwrap();
    assert_eq!(report.recovered, 1);
    assert!(h.bus.next_task(ChannelKind::Push).await.unwrap().is_none());

    let status = h.service.status(id).await.unwrap();
    let push_report = status.channel(ChannelKind::Push).unwrap();
    assert_eq!(push_report.state, ChannelState::FailedTerminal);
    assert!(push_report.last_error.as_deref().unwrap().contains("gave up after 1"));
    assert_eq!(status.status, NotificationStatus::Failed);
    assert!(h.store.find_by_id(id).await.unwrap().unwrap().settled_at.is_some());

    // nothing left for a second sweep
    tokio::time::sleep(Duration::from_millis(5)).await;
    let again = eager_sweeper(&h).sweep_once().await.unwrap();
    assert_eq!(again.recovered, 0);
}

#[tokio::test]
async fn test_sweeper_records_status_left_behind() {
    let h = harness(instant_policy(5));

    let id = h
        .service
        .submit(request("user-1", &[ChannelKind::Push]))
        .await
        .unwrap();
    let delivery = h.bus.next_task(ChannelKind::Push).await.unwrap().unwrap();
    assert!(h.service.claim(&delivery.task).await.unwrap());

    // the outcome lands but the status write after it does not
    h.store.fail_next("record_status");
    assert!(
        h.service
            .report_outcome(id, ChannelKind::Push, 1, Ok(()))
            .await
            .is_err()
    );
    let stored = h.store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.status, NotificationStatus::Pending);
    assert!(stored.settled_at.is_none());

    let report = eager_sweeper(&h).sweep_once().await.unwrap();
    assert_eq!(report.settled, 1);
    assert_eq!(report.recovered, 0);

    let stored = h.store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.status, NotificationStatus::Delivered);
    assert!(stored.settled_at.is_some());
}

#[tokio::test]
async fn test_redelivered_task_repairs_stale_status() {
    let h = harness(instant_policy(5));
    let push = ScriptedSender::new(ChannelKind::Push);

    let id = h
        .service
        .submit(request("user-1", &[ChannelKind::Push]))
        .await
        .unwrap();
    let delivery = h.bus.next_task(ChannelKind::Push).await.unwrap().unwrap();
    assert!(h.service.claim(&delivery.task).await.unwrap());
    h.store.fail_next("record_status");
    assert!(
        h.service
            .report_outcome(id, ChannelKind::Push, 1, Ok(()))
            .await
            .is_err()
    );

    let outcome = h.service.on_task(&delivery.task, &push).await.unwrap();
    assert_eq!(outcome, TaskOutcome::Skipped);
    assert_eq!(push.calls(), 0);
    assert_eq!(
        h.store.find_by_id(id).await.unwrap().unwrap().status,
        NotificationStatus::Delivered
    );
}

#[tokio::test]
async fn test_sweeper_archives_settled_notifications() {
    let h = harness(instant_policy(5));
    let push = ScriptedSender::new(ChannelKind::Push);
    let inbox = InboxService::new(h.store.clone());

    let settled = h
        .service
        .submit(request("user-1", &[ChannelKind::Push]))
        .await
        .unwrap();
    drain(&h, &[&push]).await;
    // still pending, so never archived
    h.bus.set_unavailable(true);
    let _ = h
        .service
        .submit(request("user-1", &[ChannelKind::Push]))
        .await;
    h.bus.set_unavailable(false);

    tokio::time::sleep(Duration::from_millis(5)).await;
    let sweeper = Sweeper::new(
        h.service.clone(),
        Duration::from_secs(60),
        Duration::from_secs(3600),
        Duration::from_secs(3600),
        Duration::ZERO,
    );
    let report = sweeper.sweep_once().await.unwrap();
    assert_eq!(report.archived, 1);

    let page = inbox.list("user-1", None, None).await.unwrap();
    assert_eq!(page.items.len(), 1);
    assert_ne!(page.items[0].id, settled);

    // archived records stay queryable by id
    assert_eq!(
        h.service.status(settled).await.unwrap().status,
        NotificationStatus::Delivered
    );
}

#[tokio::test]
async fn test_sweeper_stops_on_shutdown() {
    let h = harness(instant_policy(5));
    let sweeper = Sweeper::new(
        h.service.clone(),
        Duration::from_millis(10),
        Duration::from_secs(300),
        Duration::from_secs(120),
        Duration::from_secs(3600),
    );
    let (tx, rx) = tokio::sync::watch::channel(false);

    let handle = tokio::spawn(async move { sweeper.run(rx).await });
    tokio::time::sleep(Duration::from_millis(30)).await;
    tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("sweeper did not stop")
        .unwrap();
}

// ============================================================
// Inbox
// ============================================================

#[tokio::test]
async fn test_inbox_pages_newest_first() {
    let h = harness(instant_policy(5));
    let inbox = InboxService::new(h.store.clone());

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(
            h.service
                .submit(request("user-1", &[ChannelKind::Push]))
                .await
                .unwrap(),
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    h.service
        .submit(request("someone-else", &[ChannelKind::Push]))
        .await
        .unwrap();

    let mut seen = Vec::new();
    let mut cursor = None;
    loop {
        let page = inbox.list("user-1", cursor, Some(2)).await.unwrap();
        assert!(page.items.len() <= 2);
        seen.extend(page.items.iter().map(|n| n.id));
        if !page.has_next {
            assert!(page.next_cursor.is_none());
            break;
        }
        cursor = page.next_cursor;
    }

    ids.reverse();
    assert_eq!(seen, ids);
}

#[tokio::test]
async fn test_inbox_read_markers() {
    let h = harness(instant_policy(5));
    let inbox = InboxService::new(h.store.clone());

    let a = h
        .service
        .submit(request("user-1", &[ChannelKind::Push]))
        .await
        .unwrap();
    h.service
        .submit(request("user-1", &[ChannelKind::Push]))
        .await
        .unwrap();

    inbox.mark_read("user-1", a).await.unwrap();
    assert!(h.store.find_by_id(a).await.unwrap().unwrap().is_read());

    // someone else's notification
    assert!(matches!(
        inbox.mark_read("user-2", a).await,
        Err(DispatchError::NotFound(_))
    ));

    assert_eq!(inbox.mark_all_read("user-1").await.unwrap(), 1);
    assert_eq!(inbox.mark_all_read("user-1").await.unwrap(), 0);
}

#[tokio::test]
async fn test_inbox_rejects_bad_limit() {
    let h = harness(instant_policy(5));
    let inbox = InboxService::new(h.store.clone());

    for limit in [0, 101] {
        assert!(matches!(
            inbox.list("user-1", None, Some(limit)).await,
            Err(DispatchError::Validation(_))
        ));
    }
}

#[tokio::test]
async fn test_inbox_unread_listing_pages_past_read_items() {
    let h = harness(instant_policy(5));
    let inbox = InboxService::new(h.store.clone());

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(
            h.service
                .submit(request("user-1", &[ChannelKind::Push]))
                .await
                .unwrap(),
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    inbox.mark_read("user-1", ids[3]).await.unwrap();
    inbox.mark_read("user-1", ids[1]).await.unwrap();

    let first = inbox.list_unread("user-1", None, Some(2)).await.unwrap();
    assert_eq!(
        first.items.iter().map(|n| n.id).collect::<Vec<_>>(),
        vec![ids[4], ids[2]]
    );
    assert!(first.has_next);

    let rest = inbox
        .list_unread("user-1", first.next_cursor, Some(2))
        .await
        .unwrap();
    assert_eq!(
        rest.items.iter().map(|n| n.id).collect::<Vec<_>>(),
        vec![ids[0]]
    );
    assert!(!rest.has_next);

    // the plain listing still shows everything
    assert_eq!(inbox.list("user-1", None, Some(10)).await.unwrap().items.len(), 5);
}

#[tokio::test]
async fn test_inbox_dismissal_hides_without_touching_delivery() {
    let h = harness(instant_policy(5));
    let inbox = InboxService::new(h.store.clone());
    let push = ScriptedSender::new(ChannelKind::Push);

    let a = h
        .service
        .submit(request("user-1", &[ChannelKind::Push]))
        .await
        .unwrap();
    let b = h
        .service
        .submit(request("user-1", &[ChannelKind::Push]))
        .await
        .unwrap();

    inbox.dismiss("user-1", a).await.unwrap();
    assert!(matches!(
        inbox.dismiss("user-2", b).await,
        Err(DispatchError::NotFound(_))
    ));

    let page = inbox.list("user-1", None, None).await.unwrap();
    assert_eq!(page.items.iter().map(|n| n.id).collect::<Vec<_>>(), vec![b]);
    assert!(inbox.list_unread("user-1", None, None).await.unwrap().items.iter().all(|n| n.id != a));

    // delivery carries on for the dismissed notification
    drain(&h, &[&push]).await;
    assert_eq!(
        h.service.status(a).await.unwrap().status,
        NotificationStatus::Delivered
    );

    assert_eq!(inbox.dismiss_all("user-1").await.unwrap(), 1);
    assert_eq!(inbox.dismiss_all("user-1").await.unwrap(), 0);
    assert!(inbox.list("user-1", None, None).await.unwrap().items.is_empty());
}
