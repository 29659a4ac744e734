//! # SPM Sequencer
//!
//! Runs queued image-scan and spectroscopy tasks against a scanning probe
//! microscope controller that speaks a line-oriented TCP protocol.
//!
//! The work is split across the workspace:
//!
//! - `spm-core`: errors and their retry classification, argument values,
//!   retry policy, task ids.
//! - `spm-protocol`: command templates, the TCP line channel, reply parsing
//!   and the typed [`ProtocolClient`](spm_protocol::ProtocolClient).
//! - `spm-experiment`: tasks, sweeps, the task queue, progress events and the
//!   executor loop.
//!
//! This crate adds the application layer on top:
//!
//! - [`config`]: figment-based configuration (TOML file + `SPM_` environment).
//! - [`logging`]: tracing subscriber setup.
//! - [`session`]: connection, queue and executor lifecycle, including
//!   reconnect after a lost connection.

pub mod config;
pub mod logging;
pub mod session;

pub use config::{AppConfig, ConfigError};
pub use session::Session;
