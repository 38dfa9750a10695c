//! libSQL ledger backend — async `Ledger` trait implementation.
//!
//! Supports local file and in-memory databases. `libsql::Connection` is
//! `Send + Sync` and safe for concurrent async use, though this system
//! only ever writes from one cycle at a time.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, warn};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{DeliveryStatus, Ledger, LedgerEntry, NewLedgerEntry};

const ENTRY_COLUMNS: &str = "id, dedup_key, subject, sender, recipient, body, has_images, \
     image_count, received_at, processed_at, delivery_status, delivered_at, delivery_error";

/// libSQL-backed ledger.
pub struct LibSqlLedger {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlLedger {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Open(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Open(format!("Failed to open libSQL database: {e}")))?;
        Self::from_db(db).await
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| DatabaseError::Open(format!("Failed to create in-memory database: {e}")))?;
        Self::from_db(db).await
    }

    async fn from_db(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Open(format!("Failed to create connection: {e}")))?;

        let ledger = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&ledger.conn).await?;
        Ok(ledger)
    }
}

#[async_trait]
impl Ledger for LibSqlLedger {
    async fn is_processed(&self, dedup_key: &str) -> bool {
        let result = self
            .conn
            .query(
                "SELECT 1 FROM email_messages WHERE dedup_key = ?1 LIMIT 1",
                params![dedup_key],
            )
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(row) => row.is_some(),
                Err(e) => {
                    warn!("Ledger existence check failed, assuming unprocessed: {e}");
                    false
                }
            },
            Err(e) => {
                warn!("Ledger existence check failed, assuming unprocessed: {e}");
                false
            }
        }
    }

    async fn save(&self, entry: &NewLedgerEntry) -> Result<i64, DatabaseError> {
        let processed_at = Utc::now().to_rfc3339();
        let result = self
            .conn
            .execute(
                "INSERT INTO email_messages (dedup_key, subject, sender, recipient, body,
                    has_images, image_count, received_at, processed_at, delivery_status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending')",
                params![
                    entry.dedup_key.as_str(),
                    entry.subject.as_str(),
                    entry.sender.as_str(),
                    entry.recipient.as_str(),
                    entry.body.as_str(),
                    entry.has_images as i64,
                    entry.image_count as i64,
                    entry.received_at.to_rfc3339(),
                    processed_at,
                ],
            )
            .await;

        match result {
            Ok(_) => {
                let id = self.conn.last_insert_rowid();
                debug!(id, dedup_key = %entry.dedup_key, "Ledger entry inserted");
                Ok(id)
            }
            Err(e) if e.to_string().contains("UNIQUE constraint") => {
                Err(DatabaseError::Duplicate(entry.dedup_key.clone()))
            }
            Err(e) => Err(DatabaseError::Query(format!("save: {e}"))),
        }
    }

    async fn record_outcome(
        &self,
        id: i64,
        success: bool,
        error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let status = if success { "sent" } else { "failed" };
        let delivered_at = success.then(|| Utc::now().to_rfc3339());
        let delivery_error = if success { None } else { error };

        let affected = self
            .conn
            .execute(
                "UPDATE email_messages
                 SET delivery_status = ?1, delivered_at = ?2, delivery_error = ?3
                 WHERE id = ?4",
                params![status, opt_text(delivered_at), opt_text_ref(delivery_error), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_outcome: {e}")))?;

        if affected == 0 {
            return Err(DatabaseError::NotFound(id));
        }
        debug!(id, status, "Ledger outcome recorded");
        Ok(())
    }

    async fn get_by_dedup_key(
        &self,
        dedup_key: &str,
    ) -> Result<Option<LedgerEntry>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {ENTRY_COLUMNS} FROM email_messages WHERE dedup_key = ?1"),
                params![dedup_key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_by_dedup_key: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let entry = row_to_entry(&row)
                    .map_err(|e| DatabaseError::Query(format!("get_by_dedup_key row: {e}")))?;
                Ok(Some(entry))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_by_dedup_key: {e}"))),
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn opt_text(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_text_ref(s: Option<&str>) -> libsql::Value {
    opt_text(s.map(str::to_string))
}

fn str_to_status(s: &str) -> DeliveryStatus {
    match s {
        "sent" => DeliveryStatus::Sent,
        "failed" => DeliveryStatus::Failed,
        _ => DeliveryStatus::Pending,
    }
}

/// Parse an RFC 3339 datetime string from the DB.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| DateTime::<Utc>::MIN_UTC)
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn row_to_entry(row: &libsql::Row) -> Result<LedgerEntry, libsql::Error> {
    let has_images: i64 = row.get(6)?;
    let image_count: i64 = row.get(7)?;
    let received_str: String = row.get(8)?;
    let processed_str: String = row.get(9)?;
    let status_str: String = row.get(10)?;
    let delivered_str: Option<String> = row.get(11).ok();
    let error_str: Option<String> = row.get(12).ok();

    Ok(LedgerEntry {
        id: row.get(0)?,
        dedup_key: row.get(1)?,
        subject: row.get(2)?,
        sender: row.get(3)?,
        recipient: row.get(4)?,
        body: row.get(5)?,
        has_images: has_images != 0,
        image_count: image_count as u32,
        received_at: parse_datetime(&received_str),
        processed_at: parse_datetime(&processed_str),
        delivery_status: str_to_status(&status_str),
        delivered_at: parse_optional_datetime(&delivered_str),
        delivery_error: error_str,
    })
}

// ── Tests ───────────────────────────────────────────────────────────
