//! Error types for mailgram.

/// Top-level error type for the forwarder.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("Extraction error: {0}")]
    Extract(#[from] ExtractError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),
}

/// Configuration-related errors. Fatal at startup, never recovered.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// POP3 transport errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Failed to connect to {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Not connected to mail server")]
    NotConnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// MIME extraction errors. A single bad part is skipped silently; this
/// error means the whole message payload could not be parsed.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("Message could not be parsed as MIME")]
    Unparseable,
}

/// Ledger persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Failed to open database: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Duplicate dedup key: {0}")]
    Duplicate(String),

    #[error("Ledger entry not found: id {0}")]
    NotFound(i64),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Notification sink errors.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Telegram {method} failed: {detail}")]
    Api { method: String, detail: String },
}

/// Result type alias for the forwarder.
pub type Result<T> = std::result::Result<T, Error>;
