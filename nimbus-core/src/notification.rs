//! User notifications emitted by the background reconcilers

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use crate::types::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    ExpiresInThreeDays,
    ExpiresInOneDay,
    Expired,
    Deleted,
    Suspended,
    Resumed,
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NotificationKind::ExpiresInThreeDays => "expires_in_3_days",
            NotificationKind::ExpiresInOneDay => "expires_in_1_day",
            NotificationKind::Expired => "expired",
            NotificationKind::Deleted => "deleted",
            NotificationKind::Suspended => "suspended",
            NotificationKind::Resumed => "resumed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub user_id: UserId,
    pub instance_id: u64,
    pub kind: NotificationKind,
    pub message: String,
}

/// Delivery of notifications is best-effort and never fails a sweep.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// Writes notifications to the log
#[derive(Debug, Default)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn notify(&self, notification: Notification) {
        info!(
            user_id = notification.user_id,
            instance_id = notification.instance_id,
            kind = %notification.kind,
            "{}",
            notification.message
        );
    }
}

/// Keeps every notification in memory
#[derive(Debug, Default)]
pub struct MemoryNotificationSink {
    sent: Mutex<Vec<Notification>>,
}

impl MemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    pub fn kinds_for(&self, instance_id: u64) -> Vec<NotificationKind> {
        self.sent
            .lock()
            .iter()
            .filter(|n| n.instance_id == instance_id)
            .map(|n| n.kind)
            .collect()
    }
}

#[async_trait]
impl NotificationSink for MemoryNotificationSink {
    async fn notify(&self, notification: Notification) {
        self.sent.lock().push(notification);
    }
}
