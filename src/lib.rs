//! mailgram — POP3 mailbox to Telegram forwarder.

pub mod config;
pub mod error;
pub mod mail;
pub mod notify;
pub mod poller;
pub mod store;
