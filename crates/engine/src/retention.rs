//! Periodic sweeper: reconciles work a failed or crashed worker left behind
//! and archives settled notifications past the retention window.
//!
//! Each sweep, in order:
//! 1. republishes `queued` attempts whose bus task went missing
//! 2. recovers attempts left `sending` or `failed_transient` past the lease
//! 3. records the status of notifications whose channels all finished
//! 4. archives notifications settled before the retention window

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use courier_common::config::AppConfig;
use courier_common::error::DispatchError;

use crate::dispatch::{DispatchService, TaskOutcome};

/// Max rows handled per step per sweep.
const SWEEP_BATCH: usize = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub republished: usize,
    pub recovered: usize,
    pub settled: usize,
    pub archived: u64,
}

pub struct Sweeper {
    service: Arc<DispatchService>,
    interval: Duration,
    stale_after: Duration,
    sending_lease: Duration,
    retention: Duration,
}

/// `now - window`, or `None` when the window is too large to represent.
fn cutoff(now: DateTime<Utc>, window: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
}

impl Sweeper {
    pub fn new(
        service: Arc<DispatchService>,
        interval: Duration,
        stale_after: Duration,
        sending_lease: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            service,
            interval,
            stale_after,
            sending_lease,
            retention,
        }
    }

    pub fn from_config(service: Arc<DispatchService>, config: &AppConfig) -> Self {
        Self::new(
            service,
            Duration::from_secs(config.sweep_interval_secs.max(1)),
            Duration::from_secs(config.stale_queued_secs),
            Duration::from_secs(config.sending_lease_secs),
            Duration::from_secs(u64::from(config.retention_days) * 24 * 60 * 60),
        )
    }

    /// Run every step once. A failure on a single row is logged and the sweep
    /// moves on; failing to query a batch aborts the sweep.
    pub async fn sweep_once(&self) -> Result<SweepReport, DispatchError> {
        let store = self.service.store();
        let now = Utc::now();
        let mut report = SweepReport::default();

        if let Some(stale_before) = cutoff(now, self.stale_after) {
            for attempt in store.requeue_stale(stale_before, now, SWEEP_BATCH).await? {
                match self.service.republish(&attempt).await {
                    Ok(true) => report.republished += 1,
                    Ok(false) => {}
                    Err(e) => tracing::warn!(
                        notification_id = %attempt.notification_id,
                        channel = %attempt.channel,
                        error = %e,
                        "Failed to republish stale attempt"
                    ),
                }
            }
        }

        if let Some(lease_expired) = cutoff(now, self.sending_lease) {
            for attempt in store.stalled_attempts(lease_expired, now, SWEEP_BATCH).await? {
                match self.service.recover_stalled(&attempt).await {
                    Ok(TaskOutcome::Skipped) => {}
                    Ok(_) => report.recovered += 1,
                    Err(e) => tracing::warn!(
                        notification_id = %attempt.notification_id,
                        channel = %attempt.channel,
                        attempt = attempt.attempt_number,
                        error = %e,
                        "Failed to recover stalled attempt"
                    ),
                }
            }
        }

        for id in store.finished_unsettled(SWEEP_BATCH).await? {
            match self.service.refresh_status(id).await {
                Ok(agg) if agg.settled => report.settled += 1,
                Ok(_) => {}
                Err(e) => tracing::warn!(
                    notification_id = %id,
                    error = %e,
                    "Failed to record settled status"
                ),
            }
        }

        if let Some(settled_before) = cutoff(now, self.retention) {
            report.archived = store.archive_settled(settled_before).await?;
        }

        Ok(report)
    }

    /// Sweep every `interval` until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "Sweeper started"
        );
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(report) if report != SweepReport::default() => {
                            tracing::info!(
                                republished = report.republished,
                                recovered = report.recovered,
                                settled = report.settled,
                                archived = report.archived,
                                "Sweep completed"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "Sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Sweeper stopped");
    }
}
