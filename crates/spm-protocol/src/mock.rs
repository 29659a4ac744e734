//! Scripted in-memory controller.
//!
//! `MockController` implements [`Transport`] without a socket. Replies are
//! chosen per command:
//!
//! 1. the first queued one-shot reply whose prefix matches the command
//! 2. otherwise the first rule whose prefix matches
//! 3. otherwise the default reply (echo)
//!
//! Clones share state, so a test can keep a handle for inspecting the
//! commands that reached the "wire" after handing the controller to a client.

use crate::template::ResolvedCommand;
use crate::transport::Transport;
use async_trait::async_trait;
use parking_lot::Mutex;
use spm_core::TransportError;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How the mock answers a command.
#[derive(Debug, Clone, PartialEq)]
pub enum MockReply {
    /// Reply with this line.
    Line(String),
    /// Reply with the command itself.
    Echo,
    /// No reply; the send fails with `Timeout`.
    Timeout,
    /// The controller hangs up; this and every later send fails until reconnect.
    Disconnect,
    /// Reply with this line after a delay.
    Delayed(Duration, String),
}

impl MockReply {
    /// Shorthand for [`MockReply::Line`].
    pub fn line(reply: impl Into<String>) -> Self {
        MockReply::Line(reply.into())
    }
}

#[derive(Debug, Default)]
struct MockState {
    rules: Vec<(String, MockReply)>,
    script: VecDeque<(String, MockReply)>,
    default_reply: Option<MockReply>,
    sent: Vec<String>,
}

/// Transport double that answers from rules and scripts.
#[derive(Debug, Clone)]
pub struct MockController {
    state: Arc<Mutex<MockState>>,
    in_flight: Arc<tokio::sync::Mutex<()>>,
    connected: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    reconnects: Arc<AtomicUsize>,
    reply_timeout: Duration,
}

impl Default for MockController {
    fn default() -> Self {
        Self::new()
    }
}

impl MockController {
    /// Connected controller with no rules (every command is echoed).
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            in_flight: Arc::new(tokio::sync::Mutex::new(())),
            connected: Arc::new(AtomicBool::new(true)),
            closed: Arc::new(AtomicBool::new(false)),
            reconnects: Arc::new(AtomicUsize::new(0)),
            reply_timeout: Duration::from_millis(crate::transport::DEFAULT_REPLY_TIMEOUT_MS),
        }
    }

    /// A well-behaved controller for the bundled `config/commands.json`
    /// templates: setters acknowledge, start commands echo, status is idle
    /// and reads return a small data block.
    pub fn simulated() -> Self {
        let mock = Self::new();
        for prefix in ["BIAS", "SETPOINT", "FRAME", "SPEED", "PIXELS", "TIP", "SWEEP", "DELAY"] {
            mock.add_rule(prefix, MockReply::line("0"));
        }
        mock.add_rule("STATUS?", MockReply::line("IDLE"));
        mock.add_rule("IMAGE?", MockReply::line("0.0,0.1,0.2,0.3"));
        mock.add_rule("SPECTRUM?", MockReply::line("0.0,0.5,1.0"));
        mock.set_default(MockReply::Echo);
        mock
    }

    /// Builder-style [`MockController::add_rule`].
    pub fn with_rule(self, prefix: impl Into<String>, reply: MockReply) -> Self {
        self.add_rule(prefix, reply);
        self
    }

    /// Answer every command starting with `prefix` with `reply`.
    /// Earlier rules take precedence.
    pub fn add_rule(&self, prefix: impl Into<String>, reply: MockReply) {
        self.state.lock().rules.push((prefix.into(), reply));
    }

    /// Answer the next command starting with `prefix` with `reply`, once.
    pub fn script(&self, prefix: impl Into<String>, reply: MockReply) {
        self.state.lock().script.push_back((prefix.into(), reply));
    }

    /// Reply for commands no rule matches.
    pub fn set_default(&self, reply: MockReply) {
        self.state.lock().default_reply = Some(reply);
    }

    /// Duration reported in simulated timeouts.
    pub fn with_reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }

    /// Every command written so far, in order.
    pub fn sent(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    /// Number of written commands starting with `prefix`.
    pub fn sent_matching(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Simulate the controller dropping the connection.
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::Release);
    }

    /// Whether the simulated connection is up.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// How often `reconnect` succeeded.
    pub fn reconnect_count(&self) -> usize {
        self.reconnects.load(Ordering::Acquire)
    }

    fn pick_reply(&self, command: &str) -> MockReply {
        let mut state = self.state.lock();
        state.sent.push(command.to_string());

        if let Some(index) = state
            .script
            .iter()
            .position(|(prefix, _)| command.starts_with(prefix.as_str()))
        {
            if let Some((_, reply)) = state.script.remove(index) {
                return reply;
            }
        }
        state
            .rules
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, reply)| reply.clone())
            .or_else(|| state.default_reply.clone())
            .unwrap_or(MockReply::Echo)
    }
}

#[async_trait]
impl Transport for MockController {
    async fn send(&self, command: &ResolvedCommand) -> Result<String, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let _guard = self
            .in_flight
            .try_lock()
            .map_err(|_| TransportError::ChannelBusy)?;
        if !self.is_connected() {
            return Err(TransportError::ConnectionClosed);
        }

        let command = command.as_str();
        tracing::debug!(command = %command, "mock controller write");
        match self.pick_reply(command) {
            MockReply::Line(line) => Ok(line),
            MockReply::Echo => Ok(command.to_string()),
            MockReply::Timeout => Err(TransportError::Timeout(self.reply_timeout)),
            MockReply::Disconnect => {
                self.drop_connection();
                Err(TransportError::ConnectionClosed)
            }
            MockReply::Delayed(delay, line) => {
                tokio::time::sleep(delay).await;
                Ok(line)
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    async fn reconnect(&mut self) -> Result<(), TransportError> {
        self.closed.store(false, Ordering::Release);
        self.connected.store(true, Ordering::Release);
        self.reconnects.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
