//! Recipient inbox: paged listing, read markers and dismissal.
//!
//! Dismissing hides a notification from every listing; it never changes the
//! delivery state.

use std::sync::Arc;

use uuid::Uuid;

use courier_common::error::DispatchError;
use courier_common::types::{InboxCursor, InboxPage};

use crate::ports::NotificationStore;

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

pub struct InboxService {
    store: Arc<dyn NotificationStore>,
}

impl InboxService {
    pub fn new(store: Arc<dyn NotificationStore>) -> Self {
        Self { store }
    }

    /// Newest-first page of a recipient's notifications, continuing after `cursor`.
    pub async fn list(
        &self,
        recipient_id: &str,
        cursor: Option<InboxCursor>,
        limit: Option<usize>,
    ) -> Result<InboxPage, DispatchError> {
        self.page(recipient_id, cursor, limit, false).await
    }

    /// Like [`InboxService::list`], restricted to notifications not yet read.
    pub async fn list_unread(
        &self,
        recipient_id: &str,
        cursor: Option<InboxCursor>,
        limit: Option<usize>,
    ) -> Result<InboxPage, DispatchError> {
        self.page(recipient_id, cursor, limit, true).await
    }

    async fn page(
        &self,
        recipient_id: &str,
        cursor: Option<InboxCursor>,
        limit: Option<usize>,
        unread_only: bool,
    ) -> Result<InboxPage, DispatchError> {
        if recipient_id.trim().is_empty() {
            return Err(DispatchError::Validation(
                "recipient id must not be empty".to_string(),
            ));
        }
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE);
        if !(1..=MAX_PAGE_SIZE).contains(&limit) {
            return Err(DispatchError::Validation(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }

        let rows = self
            .store
            .list_for_recipient(recipient_id, cursor, limit, unread_only)
            .await?;
        Ok(InboxPage::from_rows(rows, limit))
    }

    pub async fn mark_read(&self, recipient_id: &str, id: Uuid) -> Result<(), DispatchError> {
        if self.store.mark_read(id, recipient_id).await? {
            Ok(())
        } else {
            Err(DispatchError::NotFound(id))
        }
    }

    /// Returns how many notifications were newly marked read.
    pub async fn mark_all_read(&self, recipient_id: &str) -> Result<u64, DispatchError> {
        let updated = self.store.mark_all_read(recipient_id).await?;
        tracing::debug!(recipient = %recipient_id, updated, "Marked inbox read");
        Ok(updated)
    }

    pub async fn dismiss(&self, recipient_id: &str, id: Uuid) -> Result<(), DispatchError> {
        if self.store.dismiss(id, recipient_id).await? {
            Ok(())
        } else {
            Err(DispatchError::NotFound(id))
        }
    }

    /// Returns how many notifications were newly dismissed.
    pub async fn dismiss_all(&self, recipient_id: &str) -> Result<u64, DispatchError> {
        let dismissed = self.store.dismiss_all(recipient_id).await?;
        tracing::debug!(recipient = %recipient_id, dismissed, "Dismissed inbox");
        Ok(dismissed)
    }
}
