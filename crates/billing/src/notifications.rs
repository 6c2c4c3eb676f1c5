//! Notification outbox
//!
//! Notifications are persisted before any delivery attempt so a failed send
//! never loses them. Delivery is attempted once inline; the worker retries
//! pending rows until `MAX_DELIVERY_ATTEMPTS`, after which they are marked
//! failed.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::email::Notifier;
use crate::error::{BillingError, BillingResult};
use crate::store::BillingStore;

pub const MAX_DELIVERY_ATTEMPTS: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Welcome,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Welcome => "welcome",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "welcome" => Ok(NotificationKind::Welcome),
            other => Err(BillingError::Internal(format!(
                "unknown notification kind '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "pending" => Ok(NotificationStatus::Pending),
            "sent" => Ok(NotificationStatus::Sent),
            "failed" => Ok(NotificationStatus::Failed),
            other => Err(BillingError::Internal(format!(
                "unknown notification status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub id: Uuid,
    pub kind: NotificationKind,
    pub recipient: String,
    pub context: serde_json::Value,
    pub status: NotificationStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: OffsetDateTime,
    pub sent_at: Option<OffsetDateTime>,
}

/// Counts from one outbox retry pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutboxRunSummary {
    pub attempted: usize,
    pub sent: usize,
    pub failed_permanently: usize,
}

#[derive(Clone)]
pub struct NotificationOutbox {
    store: Arc<dyn BillingStore>,
    notifier: Arc<dyn Notifier>,
}

impl NotificationOutbox {
    pub fn new(store: Arc<dyn BillingStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    pub async fn enqueue(
        &self,
        kind: NotificationKind,
        recipient: &str,
        context: serde_json::Value,
    ) -> BillingResult<Notification> {
        let notification = Notification {
            id: Uuid::new_v4(),
            kind,
            recipient: recipient.to_string(),
            context,
            status: NotificationStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: OffsetDateTime::now_utc(),
            sent_at: None,
        };
        self.store.enqueue_notification(&notification).await?;

        tracing::debug!(
            notification_id = %notification.id,
            kind = notification.kind.as_str(),
            "Enqueued notification"
        );

        Ok(notification)
    }

    /// Best-effort delivery. Returns whether the notification was sent; any
    /// failure is recorded on the row and logged.
    pub async fn deliver_now(&self, notification: &Notification) -> bool {
        if !self.notifier.is_enabled() {
            tracing::debug!(
                notification_id = %notification.id,
                "Notification delivery disabled, leaving queued"
            );
            return false;
        }

        let result = self.notifier.deliver(notification).await;
        let error = result.as_ref().err().map(|e| e.to_string());

        if let Some(error) = &error {
            tracing::warn!(
                notification_id = %notification.id,
                kind = notification.kind.as_str(),
                error = %error,
                "Notification delivery failed, left for retry"
            );
        }

        if let Err(e) = self
            .store
            .record_notification_attempt(notification.id, error.as_deref(), MAX_DELIVERY_ATTEMPTS)
            .await
        {
            tracing::error!(
                notification_id = %notification.id,
                error = %e,
                "Failed to record notification attempt"
            );
        }

        error.is_none()
    }

    /// Retry pending notifications, oldest first
    pub async fn retry_pending(&self, limit: i64) -> BillingResult<OutboxRunSummary> {
        let mut summary = OutboxRunSummary::default();
        if !self.notifier.is_enabled() {
            return Ok(summary);
        }

        let pending = self.store.list_pending_notifications(limit).await?;
        for notification in pending {
            summary.attempted += 1;
            if self.deliver_now(&notification).await {
                summary.sent += 1;
            } else if notification.attempts + 1 >= MAX_DELIVERY_ATTEMPTS {
                summary.failed_permanently += 1;
            }
        }

        if summary.attempted > 0 {
            tracing::info!(
                attempted = summary.attempted,
                sent = summary.sent,
                failed_permanently = summary.failed_permanently,
                "Notification outbox pass complete"
            );
        }

        Ok(summary)
    }
}
