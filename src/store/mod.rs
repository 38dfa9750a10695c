//! Persistence layer — the processed-message ledger.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlLedger;
pub use traits::{DeliveryStatus, Ledger, LedgerEntry, NewLedgerEntry};
