//! POP3 client — plain TCP or TLS via rustls, hand-rolled protocol.
//!
//! The wire protocol is small enough that we speak it directly instead of
//! pulling in a client crate: USER/PASS, LIST, RETR, DELE, QUIT. The
//! blocking session runs under `spawn_blocking`; [`Pop3Mailbox`] adapts it
//! to the async [`Mailbox`] trait.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use crate::error::MailboxError;
use crate::mail::{Mailbox, MessageHandle};

const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Port on which the server expects an implicit-TLS connection.
const POP3S_PORT: u16 = 995;

// ── Async trait adapter ─────────────────────────────────────────────

/// POP3 mailbox — owns the connection parameters and at most one live
/// session. All socket I/O is blocking and runs under `spawn_blocking`.
pub struct Pop3Mailbox {
    host: String,
    port: u16,
    user: String,
    password: SecretString,
    session: Option<Pop3Session>,
}

impl Pop3Mailbox {
    pub fn new(host: String, port: u16, user: String, password: SecretString) -> Self {
        Self {
            host,
            port,
            user,
            password,
            session: None,
        }
    }

    /// Run a blocking operation against the live session, moving it into
    /// the worker thread and back.
    async fn with_session<T>(
        &mut self,
        op: impl FnOnce(&mut Pop3Session) -> Result<T, MailboxError> + Send + 'static,
    ) -> Result<T, MailboxError>
    where
        T: Send + 'static,
    {
        let mut session = self.session.take().ok_or(MailboxError::NotConnected)?;
        let (session, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut session);
            (session, result)
        })
        .await
        .map_err(join_err)?;
        self.session = Some(session);
        result
    }
}

#[async_trait]
impl Mailbox for Pop3Mailbox {
    async fn connect(&mut self) -> Result<(), MailboxError> {
        let host = self.host.clone();
        let port = self.port;
        let user = self.user.clone();
        let password = self.password.expose_secret().to_string();

        let session =
            tokio::task::spawn_blocking(move || Pop3Session::connect(&host, port, &user, &password))
                .await
                .map_err(join_err)??;

        info!("Connected to POP3 server: {}:{}", self.host, self.port);
        self.session = Some(session);
        Ok(())
    }

    async fn list_messages(&mut self) -> Result<Vec<MessageHandle>, MailboxError> {
        let seqs = self.with_session(|session| session.list()).await?;
        info!("Found {} messages on server", seqs.len());
        Ok(seqs.into_iter().map(|seq| MessageHandle { seq }).collect())
    }

    async fn retrieve(&mut self, handle: MessageHandle) -> Result<Vec<u8>, MailboxError> {
        self.with_session(move |session| session.retr(handle.seq))
            .await
    }

    async fn mark_for_deletion(&mut self, handle: MessageHandle) -> Result<(), MailboxError> {
        self.with_session(move |session| session.dele(handle.seq))
            .await?;
        info!("Marked message {} for deletion", handle.seq);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = tokio::task::spawn_blocking(move || session.quit()).await;
            info!("Disconnected from POP3 server");
        }
    }
}

fn join_err(e: tokio::task::JoinError) -> MailboxError {
    MailboxError::Protocol(format!("mail task panicked: {e}"))
}

// ── Blocking session ────────────────────────────────────────────────

/// Plain or TLS byte stream.
enum Pop3Stream {
    Plain(TcpStream),
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

impl Read for Pop3Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Pop3Stream::Plain(s) => s.read(buf),
            Pop3Stream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Pop3Stream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Pop3Stream::Plain(s) => s.write(buf),
            Pop3Stream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Pop3Stream::Plain(s) => s.flush(),
            Pop3Stream::Tls(s) => s.flush(),
        }
    }
}

/// One authenticated POP3 session (blocking).
pub struct Pop3Session {
    stream: Pop3Stream,
}

impl std::fmt::Debug for Pop3Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pop3Session").finish_non_exhaustive()
    }
}

impl Pop3Session {
    /// Connect and authenticate. Port 995 uses implicit TLS, anything
    /// else a plain socket.
    pub fn connect(
        host: &str,
        port: u16,
        user: &str,
        password: &str,
    ) -> Result<Self, MailboxError> {
        let tcp = TcpStream::connect((host, port)).map_err(|e| MailboxError::Connect {
            host: host.to_string(),
            port,
            reason: e.to_string(),
        })?;
        tcp.set_read_timeout(Some(READ_TIMEOUT))?;

        let stream = if port == POP3S_PORT {
            let mut root_store = rustls::RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let tls_config = Arc::new(
                rustls::ClientConfig::builder()
                    .with_root_certificates(root_store)
                    .with_no_client_auth(),
            );
            let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
                .map_err(|e| MailboxError::Tls(e.to_string()))?;
            let conn = rustls::ClientConnection::new(tls_config, server_name)
                .map_err(|e| MailboxError::Tls(e.to_string()))?;
            Pop3Stream::Tls(Box::new(rustls::StreamOwned::new(conn, tcp)))
        } else {
            Pop3Stream::Plain(tcp)
        };

        let mut session = Self { stream };

        // Greeting, then USER/PASS. The server may reject either step.
        session.read_status_line()?;
        for cmd in [format!("USER {user}"), format!("PASS {password}")] {
            match session.command(&cmd) {
                Ok(_) => {}
                Err(MailboxError::Protocol(reason)) => return Err(MailboxError::Auth(reason)),
                Err(e) => return Err(e),
            }
        }

        Ok(session)
    }

    /// List message numbers currently on the server.
    pub fn list(&mut self) -> Result<Vec<u32>, MailboxError> {
        self.command("LIST")?;
        let listing = self.read_multiline()?;
        let text = String::from_utf8_lossy(&listing);
        Ok(text.lines().filter_map(parse_list_line).collect())
    }

    /// Retrieve the full raw message by its session-local number.
    pub fn retr(&mut self, seq: u32) -> Result<Vec<u8>, MailboxError> {
        self.command(&format!("RETR {seq}"))?;
        self.read_multiline()
    }

    /// Mark a message for deletion. Effective at QUIT.
    pub fn dele(&mut self, seq: u32) -> Result<(), MailboxError> {
        self.command(&format!("DELE {seq}"))?;
        Ok(())
    }

    /// End the session, committing pending deletions. Best-effort.
    pub fn quit(mut self) {
        let _ = self.command("QUIT");
    }

    // ── Wire helpers ────────────────────────────────────────────────

    /// Send a command and read its single status line.
    fn command(&mut self, cmd: &str) -> Result<String, MailboxError> {
        self.stream.write_all(format!("{cmd}\r\n").as_bytes())?;
        self.stream.flush()?;
        self.read_status_line()
    }

    /// Read one `+OK`/`-ERR` status line, failing on `-ERR`.
    fn read_status_line(&mut self) -> Result<String, MailboxError> {
        let line = self.read_line()?;
        let text = String::from_utf8_lossy(&line).trim_end().to_string();
        if text.starts_with("+OK") {
            Ok(text)
        } else {
            Err(MailboxError::Protocol(text))
        }
    }

    /// Read a single CRLF-terminated line, including the terminator.
    fn read_line(&mut self) -> Result<Vec<u8>, MailboxError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.stream.read(&mut byte) {
                Ok(0) => {
                    return Err(MailboxError::Protocol(
                        "connection closed by server".into(),
                    ));
                }
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(buf);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Read a multiline response body: lines up to the lone-dot
    /// terminator, with byte-stuffed leading dots removed.
    fn read_multiline(&mut self) -> Result<Vec<u8>, MailboxError> {
        let mut data = Vec::new();
        loop {
            let line = self.read_line()?;
            if line == b".\r\n" {
                return Ok(data);
            }
            data.extend_from_slice(unstuff(&line));
        }
    }
}

/// Remove the byte-stuffed leading dot from a response line.
fn unstuff(line: &[u8]) -> &[u8] {
    match line {
        [b'.', rest @ ..] => rest,
        _ => line,
    }
}

/// Parse one `LIST` response line (`"<seq> <octets>"`) into its number.
fn parse_list_line(line: &str) -> Option<u32> {
    line.split_whitespace().next()?.parse().ok()
}

// ── Tests ───────────────────────────────────────────────────────────
