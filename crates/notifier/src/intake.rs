//! Intake consumer: accepts JSON submit requests from a Redis list.
//!
//! Producers `LPUSH` requests onto the intake list. Each request is moved to
//! `<list>:processing` while it is submitted and removed once handled, so a
//! crash mid-submit leaves it recoverable.

use std::sync::Arc;
use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::watch;
use uuid::Uuid;

use courier_common::error::{AppError, DispatchError};
use courier_common::types::SubmitRequest;
use courier_engine::DispatchService;

/// What happened to one intake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Accepted(Uuid),
    /// Idempotency hit; the notification already exists.
    Duplicate(Uuid),
    /// Malformed or invalid; dropped.
    Rejected(String),
    /// Infrastructure failure; put back for another try.
    Requeue,
}

pub struct IntakeHandler {
    service: Arc<DispatchService>,
}

impl IntakeHandler {
    pub fn new(service: Arc<DispatchService>) -> Self {
        Self { service }
    }

    pub async fn handle_payload(&self, raw: &str) -> Disposition {
        let request: SubmitRequest = match serde_json::from_str(raw) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed intake message");
                return Disposition::Rejected(e.to_string());
            }
        };

        match self.service.submit(request).await {
            Ok(id) => Disposition::Accepted(id),
            Err(DispatchError::DuplicateSubmission { existing_id }) => {
                tracing::info!(notification_id = %existing_id, "Duplicate intake message");
                Disposition::Duplicate(existing_id)
            }
            Err(DispatchError::InfrastructureUnavailable(e)) => {
                tracing::error!(error = %e, "Intake submission failed, requeueing");
                Disposition::Requeue
            }
            Err(e) => {
                tracing::warn!(reason = e.reason_code(), error = %e, "Rejected intake message");
                Disposition::Rejected(e.to_string())
            }
        }
    }
}

pub struct IntakeConsumer {
    handler: IntakeHandler,
    redis: ConnectionManager,
    queue: String,
    processing: String,
    poll_interval: Duration,
}

impl IntakeConsumer {
    pub fn new(handler: IntakeHandler, redis: ConnectionManager, queue: impl Into<String>) -> Self {
        let queue = queue.into();
        Self {
            handler,
            redis,
            processing: format!("{}:processing", queue),
            queue,
            poll_interval: Duration::from_millis(250),
        }
    }

    /// Move messages a previous run left mid-submit back onto the intake list.
    pub async fn recover(&self) -> Result<usize, AppError> {
        let mut conn = self.redis.clone();
        let mut recovered = 0;
        loop {
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(&self.processing)
                .arg(&self.queue)
                .arg("RIGHT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Handle one message. Returns `None` when the list is empty.
    pub async fn poll_once(&self) -> Result<Option<Disposition>, AppError> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = redis::cmd("LMOVE")
            .arg(&self.queue)
            .arg(&self.processing)
            .arg("RIGHT")
            .arg("LEFT")
            .query_async(&mut conn)
            .await?;
        let Some(raw) = raw else {
            return Ok(None);
        };

        let disposition = self.handler.handle_payload(&raw).await;
        if disposition == Disposition::Requeue {
            let _: () = conn.lpush(&self.queue, &raw).await?;
        }
        let _: () = conn.lrem(&self.processing, 1, &raw).await?;

        Ok(Some(disposition))
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        match self.recover().await {
            Ok(0) => {}
            Ok(n) => tracing::info!(recovered = n, "Recovered in-flight intake messages"),
            Err(e) => tracing::error!(error = %e, "Intake recovery failed"),
        }
        tracing::info!(queue = %self.queue, "Intake consumer started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.poll_once().await {
                Ok(Some(Disposition::Requeue)) => true,
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    tracing::error!(error = %e, "Intake poll failed");
                    true
                }
            };
            if !idle {
                continue;
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

        tracing::info!("Intake consumer stopped");
    }
}
