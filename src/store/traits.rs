//! `Ledger` trait — the durable record of processed messages.
//!
//! One row per mailbox message, keyed by dedup key. Rows are inserted
//! once, updated exactly once with the delivery outcome, and never
//! deleted by this system.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::mail::EmailContent;

/// Delivery outcome recorded against a ledger entry.
///
/// `Pending` only exists between insert and the synchronous dispatch
/// attempt in the same cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

/// Field values for a new ledger row, copied from extracted content at
/// insert time. The body is retained for audit even after the source
/// message is deleted from the mailbox.
#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub dedup_key: String,
    pub subject: String,
    pub sender: String,
    pub recipient: String,
    pub body: String,
    pub has_images: bool,
    pub image_count: u32,
    pub received_at: DateTime<Utc>,
}

impl NewLedgerEntry {
    pub fn from_content(content: &EmailContent) -> Self {
        Self {
            dedup_key: content.dedup_key.clone(),
            subject: content.subject.clone(),
            sender: content.sender.clone(),
            recipient: content.recipient.clone(),
            body: content.body.clone(),
            has_images: !content.images.is_empty(),
            image_count: content.images.len() as u32,
            received_at: content.received_at,
        }
    }
}

/// A persisted ledger row.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub id: i64,
    pub dedup_key: String,
    pub subject: String,
    pub sender: String,
    pub recipient: String,
    pub body: String,
    pub has_images: bool,
    pub image_count: u32,
    pub received_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
    pub delivery_status: DeliveryStatus,
    pub delivered_at: Option<DateTime<Utc>>,
    pub delivery_error: Option<String>,
}

/// Backend-agnostic ledger interface. Each operation is independently
/// transactional; a failure in one never corrupts the others.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Existence check by dedup key.
    ///
    /// Fails open: an I/O error is logged and reported as `false`, since
    /// a false negative only risks one duplicate delivery attempt.
    async fn is_processed(&self, dedup_key: &str) -> bool;

    /// Constraint-checked insert. Returns the new row id, or
    /// [`DatabaseError::Duplicate`] when the dedup key is already
    /// ledgered — the unique constraint is the source of truth under
    /// races, `is_processed` is only the fast path.
    async fn save(&self, entry: &NewLedgerEntry) -> Result<i64, DatabaseError>;

    /// Record the delivery outcome for an entry inserted this cycle.
    /// [`DatabaseError::NotFound`] for an unknown id is an invariant
    /// violation, not an expected condition.
    async fn record_outcome(
        &self,
        id: i64,
        success: bool,
        error: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Fetch an entry by dedup key, for audit queries and tests.
    async fn get_by_dedup_key(
        &self,
        dedup_key: &str,
    ) -> Result<Option<LedgerEntry>, DatabaseError>;
}
