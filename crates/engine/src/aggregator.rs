//! Status aggregator: a pure function from per-channel states to the
//! notification's overall status.
//!
//! Only the latest attempt of each channel counts. Evaluation order:
//! 1. every channel cancelled -> `cancelled`
//! 2. any channel failed_terminal -> `failed` if every non-cancelled channel
//!    failed terminally, else `partially_failed`
//! 3. every channel terminal -> `cancelled` if any was cancelled, else `delivered`
//! 4. any channel beyond its first queued attempt -> `in_progress`
//! 5. otherwise `pending`

use std::collections::BTreeMap;

use courier_common::types::{
    ChannelKind, ChannelReport, ChannelState, DeliveryAttempt, Notification, NotificationStatus,
    StatusReport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aggregate {
    pub status: NotificationStatus,
    /// Every channel is in a terminal state.
    pub settled: bool,
}

/// Latest state and attempt number of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelPosition {
    pub state: ChannelState,
    pub attempt_number: u32,
}

impl ChannelPosition {
    /// A channel with no recorded attempt yet.
    const UNSTARTED: ChannelPosition = ChannelPosition {
        state: ChannelState::Queued,
        attempt_number: 1,
    };
}

pub fn rollup(positions: &[ChannelPosition]) -> Aggregate {
    use ChannelState::*;

    let settled = positions.iter().all(|p| p.state.is_terminal());
    let count = |state: ChannelState| positions.iter().filter(|p| p.state == state).count();

    let cancelled = count(Cancelled);
    let failed = count(FailedTerminal);

    let status = if !positions.is_empty() && cancelled == positions.len() {
        NotificationStatus::Cancelled
    } else if failed > 0 {
        if failed + cancelled == positions.len() {
            NotificationStatus::Failed
        } else {
            NotificationStatus::PartiallyFailed
        }
    } else if settled && !positions.is_empty() {
        if cancelled > 0 {
            NotificationStatus::Cancelled
        } else {
            NotificationStatus::Delivered
        }
    } else if positions
        .iter()
        .any(|p| p.state != Queued || p.attempt_number > 1)
    {
        NotificationStatus::InProgress
    } else {
        NotificationStatus::Pending
    };

    Aggregate { status, settled }
}

/// Latest attempt per channel.
pub fn latest_attempts(attempts: &[DeliveryAttempt]) -> BTreeMap<ChannelKind, &DeliveryAttempt> {
    let mut latest: BTreeMap<ChannelKind, &DeliveryAttempt> = BTreeMap::new();
    for attempt in attempts {
        latest
            .entry(attempt.channel)
            .and_modify(|cur| {
                if attempt.attempt_number > cur.attempt_number {
                    *cur = attempt;
                }
            })
            .or_insert(attempt);
    }
    latest
}

/// Aggregate over the notification's channel set; channels without attempts count as queued.
pub fn aggregate(channels: &[ChannelKind], attempts: &[DeliveryAttempt]) -> Aggregate {
    let latest = latest_attempts(attempts);
    let positions: Vec<ChannelPosition> = channels
        .iter()
        .map(|channel| {
            latest
                .get(channel)
                .map(|a| ChannelPosition {
                    state: a.state,
                    attempt_number: a.attempt_number,
                })
                .unwrap_or(ChannelPosition::UNSTARTED)
        })
        .collect();

    rollup(&positions)
}

/// Full status report for a notification, computed from its attempt history.
pub fn report(notification: &Notification, attempts: &[DeliveryAttempt]) -> StatusReport {
    let latest = latest_attempts(attempts);
    let Aggregate { status, settled } = aggregate(&notification.channels, attempts);

    let channels = notification
        .channels
        .iter()
        .map(|channel| match latest.get(channel) {
            Some(a) => ChannelReport {
                channel: *channel,
                state: a.state,
                attempts: a.attempt_number,
                last_error: attempts
                    .iter()
                    .filter(|x| x.channel == *channel && x.error_detail.is_some())
                    .max_by_key(|x| x.attempt_number)
                    .and_then(|x| x.error_detail.clone()),
            },
            None => ChannelReport {
                channel: *channel,
                state: ChannelState::Queued,
                attempts: 0,
                last_error: None,
            },
        })
        .collect();

    StatusReport {
        notification_id: notification.id,
        status,
        settled,
        channels,
    }
}
