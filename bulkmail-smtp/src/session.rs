//! SMTP session lifecycle: dial, greeting, optional STARTTLS upgrade, PLAIN
//! auth, as a pooled, idle-tracked unit.

use std::time::{Duration, Instant};

use base64::Engine;
use bulkmail_common::config::SmtpConfig;
use bulkmail_common::error::{Error, ErrorKind};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::connection::Connection;
use crate::response::Response;

const BUFFER_SIZE: usize = 8192;
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// A single SMTP connection, ready to send a message or sit idle in the pool.
///
/// `connection` is `Option` purely so `upgrade_to_tls` can take ownership of
/// the old transport without a placeholder value.
pub struct Session {
    connection: Option<Connection>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    last_used: Instant,
}

impl Session {
    /// Dials `host:port`, reads the greeting, upgrades to TLS via STARTTLS
    /// if the server advertises it and `use_tls` is set, then authenticates.
    ///
    /// # Errors
    /// Returns the classified transport error for any step that fails;
    /// the underlying connection is dropped on failure.
    pub async fn connect(config: &SmtpConfig) -> Result<Self, Error> {
        let addr = format!("{}:{}", config.host, config.effective_port());

        let dial_deadline = Duration::from_secs(config.connection_timeout_secs);
        let stream = timeout(dial_deadline, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::transport(ErrorKind::Network, format!("connection to {addr} timed out")))?
            .map_err(|e| Error::transport(ErrorKind::Network, format!("dial {addr} failed: {e}")))?;

        let mut session = Self {
            connection: Some(Connection::Plain(stream)),
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            last_used: Instant::now(),
        };

        let greeting = session.read_response().await?;
        if !greeting.is_success() {
            return Err(Error::transport(
                ErrorKind::Network,
                format!("unexpected greeting: {} {}", greeting.code, greeting.message()),
            ));
        }

        let ehlo = session.command(&format!("EHLO {}", config.host)).await?;
        let supports_starttls = ehlo.lines.iter().any(|line| line.eq_ignore_ascii_case("STARTTLS"));

        if config.use_tls && supports_starttls {
            let starttls = session.command("STARTTLS").await?;
            if !starttls.is_success() {
                return Err(Error::transport(
                    ErrorKind::Network,
                    format!("STARTTLS rejected: {}", starttls.message()),
                ));
            }
            let plain = session
                .connection
                .take()
                .ok_or_else(|| Error::Internal("session has no connection to upgrade".into()))?;
            session.connection = Some(
                plain
                    .upgrade_to_tls(&config.host, config.insecure_skip_verify)
                    .await?,
            );
            // Re-EHLO after upgrade, as most servers require.
            session.command(&format!("EHLO {}", config.host)).await?;
        } else if config.use_tls {
            return Err(Error::transport(
                ErrorKind::Network,
                "server does not advertise STARTTLS but use_tls is required",
            ));
        }

        if !config.username.is_empty() {
            session.authenticate(&config.username, &config.password).await?;
        }

        session.last_used = Instant::now();
        Ok(session)
    }

    async fn authenticate(&mut self, username: &str, password: &str) -> Result<(), Error> {
        let credentials = format!("\0{username}\0{password}");
        let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
        let response = self.command(&format!("AUTH PLAIN {encoded}")).await?;
        if !response.is_success() {
            return Err(Error::transport(
                ErrorKind::Auth,
                format!("authentication rejected: {} {}", response.code, response.message()),
            ));
        }
        Ok(())
    }

    /// Protocol-level no-op used by the pool's health check.
    pub async fn noop(&mut self) -> Result<(), Error> {
        let response = self.command("NOOP").await?;
        if response.is_success() {
            Ok(())
        } else {
            Err(Error::transport(
                ErrorKind::Network,
                format!("NOOP failed: {}", response.message()),
            ))
        }
    }

    pub async fn send_command(&mut self, command: &str) -> Result<(), Error> {
        let data = format!("{command}\r\n");
        self.connection_mut()?.send(data.as_bytes()).await
    }

    fn connection_mut(&mut self) -> Result<&mut Connection, Error> {
        self.connection
            .as_mut()
            .ok_or_else(|| Error::ConnectionStale("session has no active connection".into()))
    }

    pub async fn command(&mut self, command: &str) -> Result<Response, Error> {
        self.send_command(command).await?;
        self.read_response().await
    }

    /// Sends a message body following a successful `DATA` command: dot-stuffs
    /// any line starting with `.` and appends the `\r\n.\r\n` terminator,
    /// then reads the final status line.
    pub async fn send_data(&mut self, message: &str) -> Result<Response, Error> {
        let mut payload = String::with_capacity(message.len() + 8);
        for line in message.split("\r\n") {
            if line.starts_with('.') {
                payload.push('.');
            }
            payload.push_str(line);
            payload.push_str("\r\n");
        }
        payload.push_str(".\r\n");

        self.connection_mut()?.send(payload.as_bytes()).await?;
        self.read_response().await
    }

    pub(crate) async fn read_response(&mut self) -> Result<Response, Error> {
        loop {
            if let Some((response, consumed)) = Response::parse(&self.buffer[..self.buffer_pos])? {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;
                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(Error::Internal(format!(
                        "SMTP response exceeded {MAX_BUFFER_SIZE} bytes"
                    )));
                }
                self.buffer.resize(new_size, 0);
            }

            let buffer_pos = self.buffer_pos;
            let connection = self
                .connection
                .as_mut()
                .ok_or_else(|| Error::ConnectionStale("session has no active connection".into()))?;
            let n = connection.read(&mut self.buffer[buffer_pos..]).await?;
            self.buffer_pos += n;
        }
    }

    #[must_use]
    pub fn idle_age(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    pub async fn close(mut self) {
        let _ = self.command("QUIT").await;
    }
}
