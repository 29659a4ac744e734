//! Controller protocol layer.
//!
//! Translates logical controller operations into literal command lines,
//! sends them over a single line-oriented connection and interprets the
//! replies.
//!
//! ```text
//! ProtocolClient::call(op, args)
//!     │ TemplateRegistry::resolve(op.name(), args) ──▶ ResolvedCommand
//!     │ Transport::send(&command)                  ──▶ raw reply line
//!     └ parse_reply(op, &command, raw)             ──▶ Reply
//! ```
//!
//! - [`template`]: the customizable name → template mapping, validated once at load.
//! - [`transport`]: the `Transport` trait, a generic line channel and the TCP channel.
//! - [`reply`]: reply grammars (numeric ack, echo, status token, data payload).
//! - [`operation`]: the fixed set of logical operations.
//! - [`client`]: typed operations composed from the above.
//! - [`mock`]: a scripted in-memory controller for tests and dry runs.

pub mod client;
pub mod mock;
pub mod operation;
pub mod reply;
pub mod template;
pub mod transport;

pub use client::ProtocolClient;
pub use mock::{MockController, MockReply};
pub use operation::Operation;
pub use reply::{ControllerStatus, Reply, ReplyGrammar};
pub use template::{CommandTemplate, ResolvedCommand, TemplateRegistry};
pub use transport::{ChannelConfig, LineChannel, TcpChannel, Transport};
