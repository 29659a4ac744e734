//! Task queue and execution engine.
//!
//! - [`task`]: image-scan and spectroscopy tasks, their fixed step lists and status.
//! - [`sweep`]: task sets over a swept parameter, and plan files.
//! - [`queue`]: the shared scheduler (enqueue, cancel, reorder, pause).
//! - [`events`]: the progress event channel.
//! - [`executor`]: the single loop that drives tasks through the protocol client.
//!
//! # Example
//!
//! ```rust,ignore
//! let queue = Arc::new(TaskQueue::new(EventBus::new(1024)));
//! let mut events = queue.events().subscribe();
//!
//! let executor = tokio::spawn(Executor::new(client, queue.clone(), ExecutorConfig::default()).run());
//! queue.enqueue(Task::image_scan("frame", params)?);
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! ```

pub mod events;
pub mod executor;
pub mod queue;
pub mod sweep;
pub mod task;

pub use events::{EventBus, ProgressEvent};
pub use executor::{Executor, ExecutorConfig, ExecutorExit};
pub use queue::{ActiveTask, CancelOutcome, QueueSnapshot, TaskQueue, TaskSnapshot};
pub use sweep::{load_plan, ImageSweep, SweepParameter, SweepRange, TaskSpec};
pub use task::{
    format_duration, ImageScanParams, SpecMode, SpectroscopyParams, Step, Task, TaskKind,
    TaskParams, TaskStatus,
};
