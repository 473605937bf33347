//! Outbound notification seam.
//!
//! Delivery (Telegram, email) lives in an external collaborator; the
//! engine only needs somewhere to hand auto-pause and health events. The
//! default sink writes structured log lines so a bare deployment still
//! surfaces them.

use async_trait::async_trait;

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, kind: &str, payload: serde_json::Value);
}

/// Tracing-backed sink used when no collaborator is wired in.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, kind: &str, payload: serde_json::Value) {
        tracing::warn!(kind, %payload, "notification");
    }
}
