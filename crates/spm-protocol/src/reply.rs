//! Reply grammars.
//!
//! The controller answers every command with exactly one line. What that line
//! must look like depends on the operation:
//!
//! - numeric acknowledgement: the value the controller applied (`"0.5"`, `"1.2E-9"`)
//! - echo: the command text repeated back
//! - status token: `IDLE`, `READY`, `BUSY`, `SCANNING`, `RUNNING`, `DONE` or `ERROR`
//! - payload: numbers separated by commas and/or whitespace

use crate::operation::Operation;
use serde::{Deserialize, Serialize};
use spm_core::ClientError;

/// Expected shape of a reply line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyGrammar {
    /// A single number
    NumericAck,
    /// The command echoed back
    Echo,
    /// A status word such as `IDLE` or `BUSY`
    StatusToken,
    /// Whitespace- or comma-separated numbers
    Payload,
}

impl ReplyGrammar {
    /// Human-readable description used in protocol errors.
    pub fn describe(self) -> &'static str {
        match self {
            ReplyGrammar::NumericAck => "numeric acknowledgement",
            ReplyGrammar::Echo => "command echo",
            ReplyGrammar::StatusToken => "status token",
            ReplyGrammar::Payload => "numeric data payload",
        }
    }
}

/// Controller state reported by `poll_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerStatus {
    /// Ready for a new acquisition
    Idle,
    /// Acquisition in progress
    Busy,
    /// Acquisition finished
    Done,
    /// Controller reported an error
    Fault,
}

impl ControllerStatus {
    /// Parse a status token, case-insensitively.
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_uppercase().as_str() {
            "IDLE" | "READY" => Some(ControllerStatus::Idle),
            "BUSY" | "SCANNING" | "RUNNING" => Some(ControllerStatus::Busy),
            "DONE" => Some(ControllerStatus::Done),
            "ERROR" => Some(ControllerStatus::Fault),
            _ => None,
        }
    }

    /// True once the controller has finished the current acquisition.
    pub fn is_finished(self) -> bool {
        matches!(self, ControllerStatus::Idle | ControllerStatus::Done)
    }
}

/// A parsed reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    /// Numeric acknowledgement.
    Ack(f64),
    /// The command was echoed back.
    Echo,
    /// Controller status.
    Status(ControllerStatus),
    /// Raw measurement data block.
    Data(Vec<f64>),
}

impl Reply {
    /// Measurement payload, if any.
    pub fn data(&self) -> Option<&[f64]> {
        match self {
            Reply::Data(values) => Some(values),
            _ => None,
        }
    }
}

/// Check `raw` against the grammar of `operation`.
///
/// A `Fault` status is returned as [`ClientError::ControllerFault`] rather
/// than as a successful reply.
pub fn parse_reply(operation: Operation, command: &str, raw: &str) -> Result<Reply, ClientError> {
    let line = raw.trim();
    let grammar = operation.grammar();
    let mismatch = || ClientError::Protocol {
        operation: operation.name().to_string(),
        expected: grammar.describe().to_string(),
        got: line.to_string(),
    };

    match grammar {
        ReplyGrammar::NumericAck => line.parse::<f64>().map(Reply::Ack).map_err(|_| mismatch()),
        ReplyGrammar::Echo => {
            if line == command.trim() {
                Ok(Reply::Echo)
            } else {
                Err(mismatch())
            }
        }
        ReplyGrammar::StatusToken => match ControllerStatus::from_token(line) {
            Some(ControllerStatus::Fault) => Err(ClientError::ControllerFault {
                operation: operation.name().to_string(),
                detail: line.to_string(),
            }),
            Some(status) => Ok(Reply::Status(status)),
            None => Err(mismatch()),
        },
        ReplyGrammar::Payload => {
            let values = line
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|s| !s.is_empty())
                .map(str::parse::<f64>)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| mismatch())?;
            if values.is_empty() {
                return Err(mismatch());
            }
            Ok(Reply::Data(values))
        }
    }
}
