//! PostgreSQL notification store.
//!
//! Attempt writes run in a transaction that also bumps `notifications.version`,
//! so the status aggregator can detect concurrent changes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{
    ChannelKind, ChannelState, DeliveryAttempt, InboxCursor, Notification, NotificationPayload,
    NotificationStatus, Priority, Recipient,
};

use crate::ports::{AttemptTransition, NotificationStore, SaveOutcome};

#[derive(Debug, sqlx::FromRow)]
struct NotificationRow {
    id: Uuid,
    recipient_id: String,
    recipient_email: Option<String>,
    channels: Vec<String>,
    template: Option<String>,
    content: serde_json::Value,
    priority: Priority,
    idempotency_key: Option<String>,
    status: NotificationStatus,
    version: i64,
    created_at: DateTime<Utc>,
    settled_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    read_at: Option<DateTime<Utc>>,
    dismissed_at: Option<DateTime<Utc>>,
    archived_at: Option<DateTime<Utc>>,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = AppError;

    fn try_from(row: NotificationRow) -> Result<Self, Self::Error> {
        let channels = row
            .channels
            .iter()
            .map(|c| c.parse::<ChannelKind>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError::Corrupt(format!("notification {}: {}", row.id, e)))?;

        Ok(Notification {
            id: row.id,
            recipient: Recipient {
                id: row.recipient_id,
                email: row.recipient_email,
            },
            channels,
            payload: NotificationPayload {
                template: row.template,
                content: row.content,
            },
            priority: row.priority,
            idempotency_key: row.idempotency_key,
            created_at: row.created_at,
            status: row.status,
            version: row.version,
            settled_at: row.settled_at,
            cancelled_at: row.cancelled_at,
            read_at: row.read_at,
            dismissed_at: row.dismissed_at,
            archived_at: row.archived_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AttemptRow {
    notification_id: Uuid,
    channel: ChannelKind,
    attempt_number: i32,
    state: ChannelState,
    error_detail: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AttemptRow> for DeliveryAttempt {
    type Error = AppError;

    fn try_from(row: AttemptRow) -> Result<Self, Self::Error> {
        let attempt_number = u32::try_from(row.attempt_number).map_err(|e| {
            AppError::Corrupt(format!(
                "attempt {}/{}#{}: {}",
                row.notification_id, row.channel, row.attempt_number, e
            ))
        })?;

        Ok(DeliveryAttempt {
            notification_id: row.notification_id,
            channel: row.channel,
            attempt_number,
            state: row.state,
            error_detail: row.error_detail,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn to_notifications(rows: Vec<NotificationRow>) -> Result<Vec<Notification>, AppError> {
    rows.into_iter().map(Notification::try_from).collect()
}

fn to_attempts(rows: Vec<AttemptRow>) -> Result<Vec<DeliveryAttempt>, AppError> {
    rows.into_iter().map(DeliveryAttempt::try_from).collect()
}

pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_attempt(
        tx: &mut Transaction<'_, Postgres>,
        attempt: &DeliveryAttempt,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO delivery_attempts
                (notification_id, channel, attempt_number, state, error_detail, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(attempt.notification_id)
        .bind(attempt.channel)
        .bind(attempt.attempt_number as i32)
        .bind(attempt.state)
        .bind(&attempt.error_detail)
        .bind(attempt.created_at)
        .bind(attempt.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn bump_version(
        tx: &mut Transaction<'_, Postgres>,
        notification_id: Uuid,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE notifications SET version = version + 1 WHERE id = $1")
            .bind(notification_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn save(
        &self,
        notification: &Notification,
        attempts: &[DeliveryAttempt],
    ) -> Result<SaveOutcome, AppError> {
        let mut tx = self.pool.begin().await?;

        let channels: Vec<String> = notification
            .channels
            .iter()
            .map(|c| c.as_str().to_string())
            .collect();

        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO notifications
                (id, recipient_id, recipient_email, channels, template, content,
                 priority, idempotency_key, status, version, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(notification.id)
        .bind(&notification.recipient.id)
        .bind(&notification.recipient.email)
        .bind(&channels)
        .bind(&notification.payload.template)
        .bind(&notification.payload.content)
        .bind(notification.priority)
        .bind(&notification.idempotency_key)
        .bind(notification.status)
        .bind(notification.version)
        .bind(notification.created_at)
        .fetch_optional(&mut *tx)
        .await?;

        if inserted.is_none() {
            tx.rollback().await?;
            let existing_id: Uuid =
                sqlx::query_scalar("SELECT id FROM notifications WHERE idempotency_key = $1")
                    .bind(&notification.idempotency_key)
                    .fetch_one(&self.pool)
                    .await?;
            return Ok(SaveOutcome::DuplicateKey { existing_id });
        }

        for attempt in attempts {
            Self::insert_attempt(&mut tx, attempt).await?;
        }

        tx.commit().await?;
        Ok(SaveOutcome::Inserted)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Notification>, AppError> {
        let row: Option<NotificationRow> =
            sqlx::query_as("SELECT * FROM notifications WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Notification::try_from).transpose()
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Notification>, AppError> {
        let row: Option<NotificationRow> =
            sqlx::query_as("SELECT * FROM notifications WHERE idempotency_key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Notification::try_from).transpose()
    }

    async fn attempts(&self, id: Uuid) -> Result<Vec<DeliveryAttempt>, AppError> {
        let rows: Vec<AttemptRow> = sqlx::query_as(
            r#"
            SELECT * FROM delivery_attempts
            WHERE notification_id = $1
            ORDER BY channel, attempt_number
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        to_attempts(rows)
    }

    async fn append_attempt(
        &self,
        attempt: &DeliveryAttempt,
        expected_prior: u32,
    ) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await?;

        // Row lock serializes appends for the same notification.
        let exists: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM notifications WHERE id = $1 FOR UPDATE")
                .bind(attempt.notification_id)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            tx.rollback().await?;
            return Ok(false);
        }

        let latest: i32 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(MAX(attempt_number), 0) FROM delivery_attempts
            WHERE notification_id = $1 AND channel = $2
            "#,
        )
        .bind(attempt.notification_id)
        .bind(attempt.channel)
        .fetch_one(&mut *tx)
        .await?;

        if latest != expected_prior as i32 || attempt.attempt_number != expected_prior + 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        Self::insert_attempt(&mut tx, attempt).await?;
        Self::bump_version(&mut tx, attempt.notification_id).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn transition_attempt(&self, change: &AttemptTransition) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE delivery_attempts
            SET state = $5, updated_at = $6, error_detail = COALESCE($7, error_detail)
            WHERE notification_id = $1 AND channel = $2 AND attempt_number = $3 AND state = $4
            "#,
        )
        .bind(change.notification_id)
        .bind(change.channel)
        .bind(change.attempt_number as i32)
        .bind(change.from)
        .bind(change.to)
        .bind(change.at)
        .bind(&change.error_detail)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        Self::bump_version(&mut tx, change.notification_id).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn record_status(
        &self,
        id: Uuid,
        status: NotificationStatus,
        settled: bool,
        expected_version: i64,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = $2,
                settled_at = CASE WHEN $3 THEN COALESCE(settled_at, NOW()) ELSE NULL END
            WHERE id = $1 AND version = $4
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(settled)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_cancelled(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query("UPDATE notifications SET cancelled_at = COALESCE(cancelled_at, $2) WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_for_recipient(
        &self,
        recipient_id: &str,
        cursor: Option<InboxCursor>,
        limit: usize,
        unread_only: bool,
    ) -> Result<Vec<Notification>, AppError> {
        let rows: Vec<NotificationRow> = sqlx::query_as(
            r#"
            SELECT * FROM notifications
            WHERE recipient_id = $1
              AND archived_at IS NULL
              AND dismissed_at IS NULL
              AND ($2::timestamptz IS NULL OR (created_at, id) < ($2::timestamptz, $3::uuid))
              AND (NOT $4 OR read_at IS NULL)
            ORDER BY created_at DESC, id DESC
            LIMIT $5
            "#,
        )
        .bind(recipient_id)
        .bind(cursor.map(|c| c.created_at))
        .bind(cursor.map(|c| c.id))
        .bind(unread_only)
        .bind((limit + 1) as i64)
        .fetch_all(&self.pool)
        .await?;
        to_notifications(rows)
    }

    async fn mark_read(&self, id: Uuid, recipient_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE notifications SET read_at = COALESCE(read_at, NOW()) WHERE id = $1 AND recipient_id = $2",
        )
        .bind(id)
        .bind(recipient_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_all_read(&self, recipient_id: &str) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE notifications SET read_at = NOW()
            WHERE recipient_id = $1 AND read_at IS NULL AND archived_at IS NULL
            "#,
        )
        .bind(recipient_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn dismiss(&self, id: Uuid, recipient_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE notifications SET dismissed_at = COALESCE(dismissed_at, NOW())
            WHERE id = $1 AND recipient_id = $2 AND archived_at IS NULL
            "#,
        )
        .bind(id)
        .bind(recipient_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn dismiss_all(&self, recipient_id: &str) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE notifications SET dismissed_at = NOW()
            WHERE recipient_id = $1 AND dismissed_at IS NULL AND archived_at IS NULL
            "#,
        )
        .bind(recipient_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn requeue_stale(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryAttempt>, AppError> {
        let rows: Vec<AttemptRow> = sqlx::query_as(
            r#"
            UPDATE delivery_attempts d
            SET updated_at = $2
            FROM (
                SELECT da.notification_id, da.channel, da.attempt_number
                FROM delivery_attempts da
                JOIN notifications n ON n.id = da.notification_id
                WHERE da.state = 'queued'
                  AND da.updated_at < $1
                  AND n.archived_at IS NULL
                ORDER BY da.updated_at
                LIMIT $3
                FOR UPDATE OF da SKIP LOCKED
            ) stale
            WHERE d.notification_id = stale.notification_id
              AND d.channel = stale.channel
              AND d.attempt_number = stale.attempt_number
            RETURNING d.*
            "#,
        )
        .bind(older_than)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        to_attempts(rows)
    }

    async fn stalled_attempts(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryAttempt>, AppError> {
        // Only the channel's latest attempt: an old failed_transient row that
        // already has a successor is history, not work.
        let rows: Vec<AttemptRow> = sqlx::query_as(
            r#"
            UPDATE delivery_attempts d
            SET updated_at = $2
            FROM (
                SELECT da.notification_id, da.channel, da.attempt_number
                FROM delivery_attempts da
                JOIN notifications n ON n.id = da.notification_id
                WHERE da.state IN ('sending', 'failed_transient')
                  AND da.updated_at < $1
                  AND n.archived_at IS NULL
                  AND NOT EXISTS (
                      SELECT 1 FROM delivery_attempts nx
                      WHERE nx.notification_id = da.notification_id
                        AND nx.channel = da.channel
                        AND nx.attempt_number > da.attempt_number
                  )
                ORDER BY da.updated_at
                LIMIT $3
                FOR UPDATE OF da SKIP LOCKED
            ) stalled
            WHERE d.notification_id = stalled.notification_id
              AND d.channel = stalled.channel
              AND d.attempt_number = stalled.attempt_number
            RETURNING d.*
            "#,
        )
        .bind(older_than)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        to_attempts(rows)
    }

    async fn finished_unsettled(&self, limit: usize) -> Result<Vec<Uuid>, AppError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT n.id FROM notifications n
            WHERE n.settled_at IS NULL
              AND n.archived_at IS NULL
              AND NOT EXISTS (
                  SELECT 1 FROM delivery_attempts da
                  WHERE da.notification_id = n.id
                    AND da.state IN ('queued', 'sending', 'failed_transient')
                    AND NOT EXISTS (
                        SELECT 1 FROM delivery_attempts nx
                        WHERE nx.notification_id = da.notification_id
                          AND nx.channel = da.channel
                          AND nx.attempt_number > da.attempt_number
                    )
              )
            ORDER BY n.created_at
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn archive_settled(&self, settled_before: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE notifications SET archived_at = NOW()
            WHERE archived_at IS NULL AND settled_at IS NOT NULL AND settled_at < $1
            "#,
        )
        .bind(settled_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
