//! Core types for the SPM task sequencer.
//!
//! This crate holds the pieces shared by the protocol layer (`spm-protocol`)
//! and the queue/executor layer (`spm-experiment`):
//!
//! - [`error`]: the error taxonomy and the transient/fatal/permanent
//!   classification the executor uses to decide between retrying a step,
//!   failing a task and halting the whole loop.
//! - [`value`]: argument values bound into command templates.
//! - [`retry`]: the bounded retry policy applied to transient failures.
//! - [`id`]: task identifiers.

pub mod error;
pub mod id;
pub mod retry;
pub mod value;

pub use error::{
    AppResult, ClientError, FailureClass, FailureReason, QueueError, SpmError, TaskError,
    TemplateError, TransportError,
};
pub use id::TaskId;
pub use retry::RetryPolicy;
pub use value::{ArgValue, CommandArgs};
