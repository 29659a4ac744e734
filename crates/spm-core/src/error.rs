//! Error types for the sequencer.
//!
//! Errors are grouped by the layer that produces them:
//!
//! - **`TemplateError`**: resolving a logical command into a wire string. Raised
//!   at startup for a malformed template file (`MalformedTemplate`) or at
//!   resolution time for programming/config mistakes (`UnknownCommand`,
//!   `MissingArgument`, `InvalidArgument`). Never retried.
//! - **`TransportError`**: socket-level failures. `Timeout` and `ChannelBusy`
//!   are transient; anything that means the connection is gone is fatal.
//! - **`ClientError`**: what the protocol client returns. Wraps the two above
//!   and adds `Protocol` (reply did not match the expected grammar, transient)
//!   and `ControllerFault` (controller reported an error state, permanent).
//! - **`QueueError`**: caller misuse of the scheduler, rejected synchronously.
//! - **`TaskError`**: invalid task or sweep descriptions.
//!
//! [`ClientError::class`] maps every client failure onto a [`FailureClass`],
//! which is the only thing the executor looks at when deciding what to do.

use crate::id::TaskId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the aggregated error type.
pub type AppResult<T> = std::result::Result<T, SpmError>;

/// How a failed controller call affects execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retry the same step, up to the configured bound.
    Transient,
    /// The connection is gone; halt the executor and keep the queue.
    Fatal,
    /// Retrying cannot help; fail the current task immediately.
    Permanent,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            FailureClass::Transient => "transient",
            FailureClass::Fatal => "fatal",
            FailureClass::Permanent => "permanent",
        };
        write!(f, "{}", label)
    }
}

/// Errors raised while loading or resolving command templates.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    /// No template is registered under this logical name.
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// A placeholder in the template has no binding in the supplied arguments.
    #[error("command '{command}' is missing argument '{argument}'")]
    MissingArgument {
        /// Logical command name
        command: String,
        /// Placeholder that was not bound
        argument: String,
    },

    /// An argument was bound but cannot be rendered with the placeholder's format.
    #[error("command '{command}' cannot format argument '{argument}': {reason}")]
    InvalidArgument {
        /// Logical command name
        command: String,
        /// Offending placeholder
        argument: String,
        /// Why formatting failed
        reason: String,
    },

    /// The template configuration is not a flat mapping of name to template string,
    /// or one of the templates cannot be parsed.
    #[error(
        "malformed template{}: {reason}",
        .command.as_deref().map(|c| format!(" '{}'", c)).unwrap_or_default()
    )]
    MalformedTemplate {
        /// Template name, when the problem is local to one entry
        command: Option<String>,
        /// Description of the structural problem
        reason: String,
    },
}

impl TemplateError {
    /// Malformed-template error for the configuration as a whole.
    pub fn malformed(reason: impl Into<String>) -> Self {
        TemplateError::MalformedTemplate {
            command: None,
            reason: reason.into(),
        }
    }

    /// Malformed-template error for a single named entry.
    pub fn malformed_entry(command: impl Into<String>, reason: impl Into<String>) -> Self {
        TemplateError::MalformedTemplate {
            command: Some(command.into()),
            reason: reason.into(),
        }
    }
}

/// Errors raised by the transport channel.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The TCP connection could not be established.
    #[error("failed to connect to {address}: {reason}")]
    Connection {
        /// `host:port` that was dialled
        address: String,
        /// Underlying failure
        reason: String,
    },

    /// No reply line arrived within the configured interval.
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// Another request is still outstanding on this channel.
    #[error("channel busy: a request is already in flight")]
    ChannelBusy,

    /// The controller closed the socket (EOF while waiting for a reply).
    #[error("connection closed by controller")]
    ConnectionClosed,

    /// The channel was closed locally.
    #[error("channel is closed")]
    Closed,

    /// Reading from or writing to the socket failed.
    #[error("socket I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Classify this transport failure.
    pub fn class(&self) -> FailureClass {
        match self {
            TransportError::Timeout(_) | TransportError::ChannelBusy => FailureClass::Transient,
            TransportError::Connection { .. }
            | TransportError::ConnectionClosed
            | TransportError::Closed
            | TransportError::Io(_) => FailureClass::Fatal,
        }
    }
}

/// Errors returned by the protocol client.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Command could not be resolved.
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Wire I/O failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The reply did not match the grammar expected for the operation.
    #[error("{operation}: expected {expected}, got '{got}'")]
    Protocol {
        /// Logical operation that was called
        operation: String,
        /// Description of the expected reply grammar
        expected: String,
        /// Raw reply line
        got: String,
    },

    /// The controller reported an error state.
    #[error("controller fault during {operation}: {detail}")]
    ControllerFault {
        /// Logical operation that observed the fault
        operation: String,
        /// Raw status reply
        detail: String,
    },
}

impl ClientError {
    /// Classify this failure for the executor's retry/halt decision.
    pub fn class(&self) -> FailureClass {
        match self {
            ClientError::Template(_) | ClientError::ControllerFault { .. } => {
                FailureClass::Permanent
            }
            ClientError::Transport(e) => e.class(),
            ClientError::Protocol { .. } => FailureClass::Transient,
        }
    }

    /// True when the failure means the controller connection is lost.
    pub fn is_fatal(&self) -> bool {
        self.class() == FailureClass::Fatal
    }
}

/// Why a task ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// Retries exhausted on reply timeouts.
    Timeout,
    /// The controller connection dropped while the task was running.
    ConnectionLost,
    /// Retries exhausted on malformed replies (or a busy channel).
    Protocol(String),
    /// The step's command could not be resolved.
    Command(String),
    /// The controller reported a fault.
    ControllerFault(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::ConnectionLost => write!(f, "connection lost"),
            FailureReason::Protocol(msg) => write!(f, "protocol error: {}", msg),
            FailureReason::Command(msg) => write!(f, "command error: {}", msg),
            FailureReason::ControllerFault(msg) => write!(f, "controller fault: {}", msg),
        }
    }
}

impl From<&ClientError> for FailureReason {
    fn from(err: &ClientError) -> Self {
        match err {
            ClientError::Transport(TransportError::Timeout(_)) => FailureReason::Timeout,
            ClientError::Transport(e) if e.class() == FailureClass::Fatal => {
                FailureReason::ConnectionLost
            }
            ClientError::Transport(e) => FailureReason::Protocol(e.to_string()),
            ClientError::Template(e) => FailureReason::Command(e.to_string()),
            ClientError::Protocol { .. } => FailureReason::Protocol(err.to_string()),
            ClientError::ControllerFault { detail, .. } => {
                FailureReason::ControllerFault(detail.clone())
            }
        }
    }
}

/// Scheduler misuse, rejected synchronously.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Only queued (not yet started) tasks can be reordered.
    #[error("task {id} cannot be reordered: {reason}")]
    InvalidReorder {
        /// Task that was targeted
        id: TaskId,
        /// Why the request was rejected
        reason: String,
    },

    /// The task is terminal or unknown.
    #[error("task {id} cannot be cancelled: {reason}")]
    InvalidCancel {
        /// Task that was targeted
        id: TaskId,
        /// Why the request was rejected
        reason: String,
    },

    /// The task is not part of the active working set.
    #[error("task {0} is not active")]
    UnknownTask(TaskId),
}

/// Invalid task descriptions.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    /// A parameter sweep cannot produce a finite, non-empty list of values.
    #[error("invalid sweep: {0}")]
    InvalidSweep(String),

    /// A task parameter is out of its meaningful range.
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter {
        /// Parameter name
        name: String,
        /// Why it was rejected
        reason: String,
    },
}

/// Aggregated error type for the sequencer.
#[derive(Error, Debug)]
pub enum SpmError {
    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Template loading or resolution failed.
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    /// Transport failure.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Protocol client failure.
    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    /// Scheduler misuse.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Invalid task description.
    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    /// File I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON decoding failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The executor task ended abnormally.
    #[error("Executor error: {0}")]
    Executor(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_classification() {
        assert_eq!(
            TransportError::Timeout(Duration::from_millis(5)).class(),
            FailureClass::Transient
        );
        assert_eq!(TransportError::ChannelBusy.class(), FailureClass::Transient);
        assert_eq!(TransportError::ConnectionClosed.class(), FailureClass::Fatal);
        assert_eq!(TransportError::Closed.class(), FailureClass::Fatal);
        let io = std::io::Error::from(std::io::ErrorKind::BrokenPipe);
        assert_eq!(TransportError::Io(io).class(), FailureClass::Fatal);
    }

    #[test]
    fn client_classification() {
        let missing = ClientError::Template(TemplateError::MissingArgument {
            command: "set_bias".into(),
            argument: "bias".into(),
        });
        assert_eq!(missing.class(), FailureClass::Permanent);

        let protocol = ClientError::Protocol {
            operation: "set_bias".into(),
            expected: "numeric acknowledgement".into(),
            got: "???".into(),
        };
        assert_eq!(protocol.class(), FailureClass::Transient);
        assert!(!protocol.is_fatal());

        let lost = ClientError::Transport(TransportError::ConnectionClosed);
        assert!(lost.is_fatal());
    }

    #[test]
    fn failure_reason_mapping() {
        let timeout = ClientError::Transport(TransportError::Timeout(Duration::from_secs(1)));
        assert_eq!(FailureReason::from(&timeout), FailureReason::Timeout);

        let lost = ClientError::Transport(TransportError::ConnectionClosed);
        assert_eq!(FailureReason::from(&lost), FailureReason::ConnectionLost);

        let fault = ClientError::ControllerFault {
            operation: "poll_status".into(),
            detail: "ERROR".into(),
        };
        assert_eq!(
            FailureReason::from(&fault),
            FailureReason::ControllerFault("ERROR".into())
        );
    }

    #[test]
    fn malformed_template_display() {
        let whole = TemplateError::malformed("expected a JSON object");
        assert_eq!(
            whole.to_string(),
            "malformed template: expected a JSON object"
        );

        let entry = TemplateError::malformed_entry("set_bias", "unterminated placeholder");
        assert_eq!(
            entry.to_string(),
            "malformed template 'set_bias': unterminated placeholder"
        );
    }
}
