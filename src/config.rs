//! Configuration — loaded once from environment variables at startup.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default mailbox polling interval, in minutes.
const DEFAULT_CHECK_INTERVAL_MINUTES: u64 = 5;

/// Default maximum length of a formatted notification (Telegram limit headroom).
const DEFAULT_MAX_MESSAGE_LENGTH: usize = 4000;

/// Forwarder configuration.
///
/// Credentials are wrapped in [`SecretString`] so they never end up in
/// debug output or logs.
#[derive(Debug)]
pub struct Config {
    pub pop3_server: String,
    pub pop3_port: u16,
    pub pop3_user: String,
    pub pop3_password: SecretString,
    pub telegram_bot_token: SecretString,
    pub telegram_chat_id: String,
    pub database_path: PathBuf,
    pub check_interval: Duration,
    pub max_message_length: usize,
}

impl Config {
    /// Build and validate configuration from the process environment.
    ///
    /// Missing required variables fail here, before anything connects.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup (testable seam).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let pop3_server = require(&lookup, "POP3_SERVER")?;
        let pop3_port = parse_or(&lookup, "POP3_PORT", 110u16)?;
        let pop3_user = require(&lookup, "POP3_USER")?;
        let pop3_password = SecretString::from(require(&lookup, "POP3_PASSWORD")?);

        let telegram_bot_token = SecretString::from(require(&lookup, "TELEGRAM_BOT_TOKEN")?);
        let telegram_chat_id = require(&lookup, "TELEGRAM_CHAT_ID")?;

        let database_path = lookup("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/mailgram.db"));

        let interval_minutes = parse_or(
            &lookup,
            "CHECK_INTERVAL_MINUTES",
            DEFAULT_CHECK_INTERVAL_MINUTES,
        )?;
        if interval_minutes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CHECK_INTERVAL_MINUTES".into(),
                message: "must be at least 1".into(),
            });
        }

        let max_message_length =
            parse_or(&lookup, "MAX_MESSAGE_LENGTH", DEFAULT_MAX_MESSAGE_LENGTH)?;

        Ok(Self {
            pop3_server,
            pop3_port,
            pop3_user,
            pop3_password,
            telegram_bot_token,
            telegram_chat_id,
            database_path,
            check_interval: Duration::from_secs(interval_minutes * 60),
            max_message_length,
        })
    }
}

/// Look up a required variable, rejecting empty values.
fn require(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<String, ConfigError> {
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingEnvVar(key.to_string())),
    }
}

/// Look up an optional variable and parse it, falling back to a default.
fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("could not parse {value:?}"),
        }),
        None => Ok(default),
    }
}

// ── Tests ───────────────────────────────────────────────────────────
