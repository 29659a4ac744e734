//! Transport Channel.
//!
//! A single persistent, line-oriented connection to the controller. The wire
//! protocol has no request ids, so the channel allows exactly one outstanding
//! request: a `send` issued while another is unresolved fails immediately with
//! [`TransportError::ChannelBusy`] instead of waiting for the lock, and nothing
//! is written for it.
//!
//! The request/reply cycle is:
//!
//! 1. discard any bytes already buffered (a late reply to an earlier,
//!    timed-out request must never be attributed to this one)
//! 2. write the command followed by the line terminator and flush
//! 3. read one line within `reply_timeout`; EOF means the controller hung up

use crate::template::ResolvedCommand;
use async_trait::async_trait;
use futures::FutureExt;
use spm_core::TransportError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Default reply timeout in milliseconds.
pub const DEFAULT_REPLY_TIMEOUT_MS: u64 = 2000;

/// Default connect timeout in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Something that can carry one command and bring back one reply line.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `command` and wait for its reply line (trimmed).
    async fn send(&self, command: &ResolvedCommand) -> Result<String, TransportError>;

    /// Close the connection. Idempotent; subsequent sends fail with `Closed`.
    async fn close(&self);

    /// Replace the underlying connection with a fresh one.
    async fn reconnect(&mut self) -> Result<(), TransportError> {
        Err(TransportError::Connection {
            address: "<none>".to_string(),
            reason: "transport does not support reconnecting".to_string(),
        })
    }

    /// Whether `close` has been called.
    fn is_closed(&self) -> bool;
}

/// Timing and framing parameters of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// How long to wait for a reply line.
    pub reply_timeout: Duration,
    /// How long to wait for the TCP handshake.
    pub connect_timeout: Duration,
    /// Appended to every outgoing command.
    pub terminator: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_millis(DEFAULT_REPLY_TIMEOUT_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            terminator: "\n".to_string(),
        }
    }
}

/// Line-oriented request/reply channel over any async byte stream.
pub struct LineChannel<S> {
    stream: Mutex<Option<BufReader<S>>>,
    closed: AtomicBool,
    config: ChannelConfig,
}

impl<S> LineChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an already-connected stream.
    pub fn new(stream: S, config: ChannelConfig) -> Self {
        Self {
            stream: Mutex::new(Some(BufReader::new(stream))),
            closed: AtomicBool::new(false),
            config,
        }
    }

    /// Channel parameters.
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Send one command and read one reply line.
    pub async fn request(&self, command: &str) -> Result<String, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let mut guard = self
            .stream
            .try_lock()
            .map_err(|_| TransportError::ChannelBusy)?;
        let stream = guard.as_mut().ok_or(TransportError::Closed)?;

        discard_stale(stream);

        let line = format!("{}{}", command, self.config.terminator);
        tracing::debug!(command = %command, "controller write");
        stream.get_mut().write_all(line.as_bytes()).await?;
        stream.get_mut().flush().await?;

        let mut reply = String::new();
        match timeout(self.config.reply_timeout, stream.read_line(&mut reply)).await {
            Ok(Ok(0)) => Err(TransportError::ConnectionClosed),
            Ok(Ok(_)) => {
                let trimmed = reply.trim().to_string();
                tracing::debug!(reply = %trimmed, "controller reply");
                Ok(trimmed)
            }
            Ok(Err(e)) => Err(TransportError::Io(e)),
            Err(_) => {
                tracing::warn!(command = %command, timeout = ?self.config.reply_timeout, "no reply");
                Err(TransportError::Timeout(self.config.reply_timeout))
            }
        }
    }

    /// Mark the channel closed and shut the stream down.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut guard = self.stream.lock().await;
        if let Some(mut stream) = guard.take() {
            if let Err(e) = stream.get_mut().shutdown().await {
                tracing::debug!(error = %e, "error while shutting down controller stream");
            }
        }
    }

    /// Whether `shutdown` has been called.
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Drop whatever is already readable without waiting for more.
fn discard_stale<S: AsyncRead + Unpin>(stream: &mut BufReader<S>) {
    loop {
        let pending = match stream.fill_buf().now_or_never() {
            Some(Ok(buf)) => buf.len(),
            _ => 0,
        };
        if pending == 0 {
            break;
        }
        tracing::debug!(bytes = pending, "discarding stale controller bytes");
        stream.consume(pending);
    }
}

#[async_trait]
impl<S> Transport for LineChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&self, command: &ResolvedCommand) -> Result<String, TransportError> {
        self.request(command.as_str()).await
    }

    async fn close(&self) {
        self.shutdown().await;
    }

    fn is_closed(&self) -> bool {
        self.closed()
    }
}

/// Line channel over TCP with reconnect support.
pub struct TcpChannel {
    address: String,
    channel: LineChannel<TcpStream>,
}

impl TcpChannel {
    /// Connect to `address` (`host:port`).
    pub async fn connect(
        address: impl Into<String>,
        config: ChannelConfig,
    ) -> Result<Self, TransportError> {
        let address = address.into();
        let stream = open(&address, config.connect_timeout).await?;
        tracing::info!(address = %address, "Connected to controller");
        Ok(Self {
            address,
            channel: LineChannel::new(stream, config),
        })
    }

    /// Address this channel dials.
    pub fn address(&self) -> &str {
        &self.address
    }
}

async fn open(address: &str, connect_timeout: Duration) -> Result<TcpStream, TransportError> {
    let connection_error = |reason: String| TransportError::Connection {
        address: address.to_string(),
        reason,
    };

    let stream = timeout(connect_timeout, TcpStream::connect(address))
        .await
        .map_err(|_| connection_error(format!("timed out after {:?}", connect_timeout)))?
        .map_err(|e| connection_error(e.to_string()))?;

    // Commands are short and latency-bound
    stream
        .set_nodelay(true)
        .map_err(|e| connection_error(e.to_string()))?;
    Ok(stream)
}

#[async_trait]
impl Transport for TcpChannel {
    async fn send(&self, command: &ResolvedCommand) -> Result<String, TransportError> {
        self.channel.request(command.as_str()).await
    }

    async fn close(&self) {
        self.channel.shutdown().await;
    }

    async fn reconnect(&mut self) -> Result<(), TransportError> {
        let config = self.channel.config().clone();
        let stream = open(&self.address, config.connect_timeout).await?;
        let previous = std::mem::replace(&mut self.channel, LineChannel::new(stream, config));
        previous.shutdown().await;
        tracing::info!(address = %self.address, "Reconnected to controller");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.channel.closed()
    }
}
