//! Mailbox access — POP3 transport and MIME content extraction.

pub mod extract;
pub mod pop3;

pub use extract::{EmailContent, ImageAttachment};
pub use pop3::Pop3Mailbox;

use async_trait::async_trait;

use crate::error::MailboxError;

/// Position of a message within the current mailbox session.
///
/// POP3 message numbers are 1-based and only valid until the session
/// closes; they must never be persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHandle {
    pub seq: u32,
}

/// Scoped mailbox connection used by one polling cycle.
///
/// `connect` is called at the start of a cycle and `disconnect`
/// unconditionally at the end, on every exit path. Deletion marks are
/// advisory until the connection closes.
#[async_trait]
pub trait Mailbox: Send {
    async fn connect(&mut self) -> Result<(), MailboxError>;

    async fn list_messages(&mut self) -> Result<Vec<MessageHandle>, MailboxError>;

    async fn retrieve(&mut self, handle: MessageHandle) -> Result<Vec<u8>, MailboxError>;

    async fn mark_for_deletion(&mut self, handle: MessageHandle) -> Result<(), MailboxError>;

    async fn disconnect(&mut self);
}
