//! Notification delivery — formatting and dispatch to the chat sink.

pub mod telegram;

pub use telegram::TelegramNotifier;

use async_trait::async_trait;

use crate::mail::EmailContent;

/// Result of a delivery attempt.
///
/// On total failure `error` carries the cause — for an image delivery
/// whose text fallback also failed, both causes concatenated.
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub success: bool,
    pub error: Option<String>,
}

impl DeliveryOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: String) -> Self {
        Self {
            success: false,
            error: Some(error),
        }
    }
}

/// Notification sink. Rendering and the single image→text fallback live
/// behind this seam; no retries happen beyond that fallback.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Format and send one notification, blocking until the sink
    /// accepts or rejects it.
    async fn deliver(&self, content: &EmailContent) -> DeliveryOutcome;

    /// Startup connectivity probe.
    async fn test_connection(&self) -> bool;
}
