//! Approval waiter port.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Notify;

/// Signal-based primitive the host implements to wake a paused run.
///
/// `wait` resolves when the paused run should be re-inspected (typically
/// after the host wrote the `__approval_<blockId>` context key). When no
/// waiter is provided the executor falls back to periodic re-inspection.
#[async_trait]
pub trait ApprovalWaiter: Send + Sync {
    async fn wait(&self);
}

/// Notify-backed waiter for in-process hosts and tests.
#[derive(Default)]
pub struct NotifyWaiter {
    notify: Arc<Notify>,
}

impl NotifyWaiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle the host keeps to signal the waiter.
    pub fn handle(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

#[async_trait]
impl ApprovalWaiter for NotifyWaiter {
    async fn wait(&self) {
        self.notify.notified().await;
    }
}
