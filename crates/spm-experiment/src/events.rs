//! Progress events.
//!
//! The executor is the single producer; any number of subscribers (preview,
//! export, operator console) consume. Emission goes through a
//! `tokio::sync::broadcast` channel: sending never waits, and a receiver that
//! falls more than `capacity` events behind loses the oldest ones and sees
//! `RecvError::Lagged` instead.

use serde::{Deserialize, Serialize};
use spm_core::TaskId;
use spm_protocol::Operation;
use tokio::sync::broadcast;

use crate::task::TaskStatus;

/// Default number of events buffered per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Something happened in the queue or the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// A task was appended to the queue.
    #[allow(missing_docs)]
    TaskEnqueued { task_id: TaskId, name: String },
    /// A task changed status.
    #[allow(missing_docs)]
    StatusChanged { task_id: TaskId, status: TaskStatus },
    /// The executor is about to send a step.
    StepStarted {
        /// Owning task
        task_id: TaskId,
        /// Zero-based step index
        step: usize,
        /// Steps in the task
        total: usize,
        /// Operation being sent
        operation: Operation,
    },
    /// A step finished successfully.
    StepCompleted {
        /// Owning task
        task_id: TaskId,
        /// Zero-based step index
        step: usize,
        /// Steps in the task
        total: usize,
    },
    /// A step failed transiently and is about to be retried.
    StepRetry {
        /// Owning task
        task_id: TaskId,
        /// Zero-based step index
        step: usize,
        /// Retry number, starting at 1
        attempt: u32,
        /// The failure being retried
        error: String,
    },
    /// A measurement-bearing step returned data.
    Measurement {
        /// Owning task
        task_id: TaskId,
        /// Zero-based step index
        step: usize,
        /// Read operation that produced the data
        operation: Operation,
        /// Parsed payload
        data: Vec<f64>,
    },
    /// The queue stopped handing out tasks.
    QueuePaused,
    /// The queue hands out tasks again.
    QueueResumed,
    /// The controller connection was lost; the executor has stopped.
    #[allow(missing_docs)]
    Disconnected { reason: String },
}

impl ProgressEvent {
    /// The task this event concerns, if any.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            ProgressEvent::TaskEnqueued { task_id, .. }
            | ProgressEvent::StatusChanged { task_id, .. }
            | ProgressEvent::StepStarted { task_id, .. }
            | ProgressEvent::StepCompleted { task_id, .. }
            | ProgressEvent::StepRetry { task_id, .. }
            | ProgressEvent::Measurement { task_id, .. } => Some(*task_id),
            ProgressEvent::QueuePaused
            | ProgressEvent::QueueResumed
            | ProgressEvent::Disconnected { .. } => None,
        }
    }
}

/// Cloneable sending side of the progress channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ProgressEvent>,
}

impl EventBus {
    /// Bus buffering up to `capacity` events per lagging subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// New receiver seeing every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    /// Emit without waiting. Having no subscribers is not an error.
    pub fn emit(&self, event: ProgressEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("progress event dropped: no subscribers");
        }
    }

    /// Number of live receivers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    #[tokio::test]
    async fn emits_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(ProgressEvent::QueuePaused);
        bus.emit(ProgressEvent::QueueResumed);

        assert_eq!(rx.recv().await.unwrap(), ProgressEvent::QueuePaused);
        assert_eq!(rx.recv().await.unwrap(), ProgressEvent::QueueResumed);
    }

    #[tokio::test]
    async fn slow_subscriber_loses_oldest() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..3 {
            bus.emit(ProgressEvent::QueuePaused);
        }
        bus.emit(ProgressEvent::QueueResumed);

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(2))));
        assert_eq!(rx.recv().await.unwrap(), ProgressEvent::QueuePaused);
        assert_eq!(rx.recv().await.unwrap(), ProgressEvent::QueueResumed);
    }

    #[test]
    fn emit_without_subscribers() {
        let bus = EventBus::default();
        bus.emit(ProgressEvent::Disconnected {
            reason: "test".into(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
