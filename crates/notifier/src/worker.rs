//! Worker pool consuming dispatch tasks from the bus.
//!
//! Each channel kind gets `workers_per_channel` independent workers. A worker
//! processes one task to completion, acknowledges it, and only then checks
//! for shutdown, so in-flight deliveries always finish.
//!
//! A task that hit a store or bus outage is published again with a delay
//! before it is acknowledged; if even that fails it stays unacknowledged.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use courier_common::error::{AppError, ChannelError, DispatchError};
use courier_common::types::ChannelKind;
use courier_engine::ports::{Delivery, MessageBus};
use courier_engine::{DispatchService, TaskOutcome};

use crate::channels::ChannelRegistry;

/// Idle wait between polls when a channel's queue is empty.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Delay before a task that hit an outage is offered again.
pub const DEFAULT_REDELIVERY_DELAY: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct WorkerPool {
    service: Arc<DispatchService>,
    bus: Arc<dyn MessageBus>,
    registry: ChannelRegistry,
    workers_per_channel: usize,
    poll_interval: Duration,
    redelivery_delay: Duration,
}

impl WorkerPool {
    pub fn new(
        service: Arc<DispatchService>,
        bus: Arc<dyn MessageBus>,
        registry: ChannelRegistry,
        workers_per_channel: usize,
    ) -> Self {
        Self {
            service,
            bus,
            registry,
            workers_per_channel: workers_per_channel.max(1),
            poll_interval: DEFAULT_POLL_INTERVAL,
            redelivery_delay: DEFAULT_REDELIVERY_DELAY,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_redelivery_delay(mut self, redelivery_delay: Duration) -> Self {
        self.redelivery_delay = redelivery_delay;
        self
    }

    /// Spawn workers for every channel kind. Channels without a sender still
    /// get workers so their tasks are recorded as failed instead of piling up.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for channel in ChannelKind::ALL {
            for worker_id in 0..self.workers_per_channel {
                let pool = self.clone();
                let shutdown = shutdown.clone();
                handles.push(tokio::spawn(async move {
                    pool.run_worker(channel, worker_id, shutdown).await;
                }));
            }
        }

        tracing::info!(
            channels = ChannelKind::ALL.len(),
            workers_per_channel = self.workers_per_channel,
            "Worker pool started"
        );
        handles
    }

    async fn run_worker(
        &self,
        channel: ChannelKind,
        worker_id: usize,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::debug!(channel = %channel, worker_id, "Worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.process_next(channel).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(channel = %channel, worker_id, error = %e, "Bus poll failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::debug!(channel = %channel, worker_id, "Worker stopped");
    }

    /// Take and fully process one task for `channel`.
    ///
    /// Returns `false` when no task was ready. A task whose processing hit an
    /// infrastructure outage is published again after the redelivery delay;
    /// anything the redelivery cannot fix (an attempt left mid-send) is
    /// recovered by the sweeper.
    pub async fn process_next(&self, channel: ChannelKind) -> Result<bool, AppError> {
        let Some(delivery) = self.bus.next_task(channel).await? else {
            return Ok(false);
        };
        let task = &delivery.task;

        match self.handle(&delivery).await {
            Ok(outcome) => {
                tracing::debug!(
                    notification_id = %task.notification_id,
                    channel = %channel,
                    attempt = task.attempt_number,
                    outcome = ?outcome,
                    "Task processed"
                );
            }
            Err(DispatchError::InfrastructureUnavailable(e)) => {
                tracing::warn!(
                    notification_id = %task.notification_id,
                    channel = %channel,
                    attempt = task.attempt_number,
                    error = %e,
                    "Task hit an outage, redelivering later"
                );
                // Without the copy the task must stay in processing.
                self.bus.publish(task, Some(self.redelivery_delay)).await?;
            }
            Err(e) => {
                tracing::error!(
                    notification_id = %task.notification_id,
                    channel = %channel,
                    attempt = task.attempt_number,
                    reason = e.reason_code(),
                    error = %e,
                    "Task processing failed"
                );
            }
        }

        self.bus.ack(&delivery).await?;
        Ok(true)
    }

    async fn handle(&self, delivery: &Delivery) -> Result<TaskOutcome, DispatchError> {
        let task = &delivery.task;
        match self.registry.get(task.channel) {
            Some(sender) => self.service.on_task(task, sender.as_ref()).await,
            None => {
                if !self.service.claim(task).await? {
                    return Ok(TaskOutcome::Skipped);
                }
                tracing::warn!(
                    notification_id = %task.notification_id,
                    channel = %task.channel,
                    "No sender configured for channel"
                );
                self.service
                    .report_outcome(
                        task.notification_id,
                        task.channel,
                        task.attempt_number,
                        Err(ChannelError::Terminal(format!(
                            "{} channel is not configured",
                            task.channel
                        ))),
                    )
                    .await
            }
        }
    }
}
