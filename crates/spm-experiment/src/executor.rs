//! Executor.
//!
//! Drives one task at a time through the protocol client:
//!
//! ```text
//! loop:
//!   task = queue.next_task()              (idles on empty/paused queue)
//!   for step in task.steps:
//!     cancel requested?      → Cancelled
//!     call step              → transient failure: retry same step (bounded)
//!                            → permanent failure: Failed{reason}, next task
//!                            → connection lost:   Failed{ConnectionLost}, halt
//!   Completed
//! ```
//!
//! The executor owns the [`ProtocolClient`] and gives it back when it stops
//! ([`ExecutorExit`]), so there is never more than one executor talking to a
//! controller connection. After a fatal disconnect the queue is left as it
//! is; reconnect the client and start a new executor over the same queue to
//! resume.

use crate::events::{EventBus, ProgressEvent};
use crate::queue::{ActiveTask, TaskQueue};
use crate::task::{Step, TaskStatus};
use spm_core::{ClientError, FailureClass, FailureReason, RetryPolicy};
use spm_protocol::{Operation, ProtocolClient, Reply, Transport};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default pause between two status polls.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Executor tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Bound on retries of one step after transient failures.
    pub retry: RetryPolicy,
    /// Pause between status polls while the controller reports busy.
    pub poll_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

/// Why the executor loop returned. Either way the client is handed back.
pub enum ExecutorExit<T: Transport> {
    /// The queue was closed.
    #[allow(missing_docs)]
    Shutdown { client: ProtocolClient<T> },
    /// The controller connection was lost.
    Disconnected {
        /// Client with the dead connection, ready for `reconnect`
        client: ProtocolClient<T>,
        /// Transport error that ended the loop
        reason: String,
    },
}

impl<T: Transport> ExecutorExit<T> {
    /// Take back the client, whatever the exit.
    pub fn into_client(self) -> ProtocolClient<T> {
        match self {
            ExecutorExit::Shutdown { client } | ExecutorExit::Disconnected { client, .. } => client,
        }
    }

    /// True when the loop ended on a lost connection.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ExecutorExit::Disconnected { .. })
    }
}

impl<T: Transport> std::fmt::Debug for ExecutorExit<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorExit::Shutdown { .. } => f.write_str("Shutdown"),
            ExecutorExit::Disconnected { reason, .. } => {
                f.debug_struct("Disconnected").field("reason", reason).finish()
            }
        }
    }
}

enum StepFailure {
    Cancelled,
    Failed(FailureReason),
    ConnectionLost(ClientError),
}

enum TaskOutcome {
    Finished(TaskStatus),
    ConnectionLost(String),
}

/// The single consumer of the task queue.
pub struct Executor<T: Transport> {
    client: ProtocolClient<T>,
    queue: Arc<TaskQueue>,
    events: EventBus,
    config: ExecutorConfig,
}

impl<T: Transport> Executor<T> {
    /// Executor driving `client` from `queue`. Does nothing until [`run`](Self::run).
    pub fn new(client: ProtocolClient<T>, queue: Arc<TaskQueue>, config: ExecutorConfig) -> Self {
        let events = queue.events().clone();
        Self {
            client,
            queue,
            events,
            config,
        }
    }

    /// Run until the queue is closed or the connection is lost.
    pub async fn run(self) -> ExecutorExit<T> {
        info!(
            max_retries = self.config.retry.max_retries,
            "Executor started"
        );

        while let Some(task) = self.queue.next_task().await {
            match self.run_task(&task).await {
                TaskOutcome::Finished(status) => self.finalize(&task, status),
                TaskOutcome::ConnectionLost(reason) => {
                    self.finalize(
                        &task,
                        TaskStatus::Failed {
                            reason: FailureReason::ConnectionLost,
                        },
                    );
                    warn!(reason = %reason, "Controller connection lost, executor halted");
                    self.events.emit(ProgressEvent::Disconnected {
                        reason: reason.clone(),
                    });
                    return ExecutorExit::Disconnected {
                        client: self.client,
                        reason,
                    };
                }
            }
        }

        info!("Executor stopped");
        ExecutorExit::Shutdown {
            client: self.client,
        }
    }

    fn finalize(&self, task: &ActiveTask, status: TaskStatus) {
        if let Err(e) = self.queue.finish(task.id, status) {
            warn!(task_id = %task.id, error = %e, "Could not finalize task");
        }
    }

    async fn run_task(&self, task: &ActiveTask) -> TaskOutcome {
        let total = task.steps.len();
        for (index, step) in task.steps.iter().enumerate() {
            if task.cancel_requested() {
                info!(task_id = %task.id, step = index, "Cancelled before step");
                return TaskOutcome::Finished(TaskStatus::Cancelled);
            }

            self.events.emit(ProgressEvent::StepStarted {
                task_id: task.id,
                step: index,
                total,
                operation: step.operation,
            });

            match self.run_step(task, index, step).await {
                Ok(()) => {
                    if let Err(e) = self.queue.record_progress(task.id, index + 1) {
                        debug!(task_id = %task.id, error = %e, "Progress not recorded");
                    }
                    self.events.emit(ProgressEvent::StepCompleted {
                        task_id: task.id,
                        step: index,
                        total,
                    });
                }
                Err(StepFailure::Cancelled) => {
                    return TaskOutcome::Finished(TaskStatus::Cancelled);
                }
                Err(StepFailure::Failed(reason)) => {
                    return TaskOutcome::Finished(TaskStatus::Failed { reason });
                }
                Err(StepFailure::ConnectionLost(err)) => {
                    return TaskOutcome::ConnectionLost(err.to_string());
                }
            }
        }
        TaskOutcome::Finished(TaskStatus::Completed)
    }

    async fn run_step(&self, task: &ActiveTask, index: usize, step: &Step) -> Result<(), StepFailure> {
        if step.operation == Operation::PollStatus {
            return self.wait_until_finished(task, index, step).await;
        }

        if let Reply::Data(data) = self.call_with_retry(task, index, step).await? {
            debug!(task_id = %task.id, step = index, values = data.len(), "Measurement received");
            self.events.emit(ProgressEvent::Measurement {
                task_id: task.id,
                step: index,
                operation: step.operation,
                data,
            });
        }
        Ok(())
    }

    /// Poll until the controller reports idle or done. Each poll is a
    /// complete exchange, so cancellation is honoured between polls.
    async fn wait_until_finished(
        &self,
        task: &ActiveTask,
        index: usize,
        step: &Step,
    ) -> Result<(), StepFailure> {
        loop {
            match self.call_with_retry(task, index, step).await? {
                Reply::Status(status) if status.is_finished() => return Ok(()),
                Reply::Status(status) => {
                    debug!(task_id = %task.id, ?status, "Controller busy");
                }
                other => {
                    return Err(StepFailure::Failed(FailureReason::Protocol(format!(
                        "unexpected status reply {:?}",
                        other
                    ))))
                }
            }
            tokio::time::sleep(self.config.poll_interval).await;
            if task.cancel_requested() {
                info!(task_id = %task.id, step = index, "Cancelled while waiting for controller");
                return Err(StepFailure::Cancelled);
            }
        }
    }

    async fn call_with_retry(
        &self,
        task: &ActiveTask,
        index: usize,
        step: &Step,
    ) -> Result<Reply, StepFailure> {
        let mut retries = 0;
        loop {
            let err = match self.client.call(step.operation, &step.args).await {
                Ok(reply) => return Ok(reply),
                Err(err) => err,
            };

            match err.class() {
                FailureClass::Fatal => return Err(StepFailure::ConnectionLost(err)),
                FailureClass::Permanent => {
                    warn!(task_id = %task.id, step = index, error = %err, "Step failed permanently");
                    return Err(StepFailure::Failed(FailureReason::from(&err)));
                }
                FailureClass::Transient if !self.config.retry.allows_retry(retries) => {
                    warn!(
                        task_id = %task.id,
                        step = index,
                        retries,
                        error = %err,
                        "Retries exhausted"
                    );
                    return Err(StepFailure::Failed(FailureReason::from(&err)));
                }
                FailureClass::Transient => {
                    retries += 1;
                    warn!(
                        task_id = %task.id,
                        step = index,
                        attempt = retries,
                        error = %err,
                        "Transient failure, retrying step"
                    );
                    self.events.emit(ProgressEvent::StepRetry {
                        task_id: task.id,
                        step: index,
                        attempt: retries,
                        error: err.to_string(),
                    });
                    tokio::time::sleep(self.config.retry.retry_delay).await;
                    if task.cancel_requested() {
                        return Err(StepFailure::Cancelled);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Task, TaskKind};
    use spm_protocol::{MockController, MockReply, TemplateRegistry};

    fn client(mock: &MockController) -> ProtocolClient<MockController> {
        let templates = TemplateRegistry::from_json_str(
            r#"{"start_scan": "SCAN START", "poll_status": "STATUS?", "read_image": "IMAGE? ${repetition:d}"}"#,
        )
        .unwrap();
        ProtocolClient::new(Arc::new(templates), mock.clone())
    }

    fn fast() -> ExecutorConfig {
        ExecutorConfig {
            retry: RetryPolicy::new(2, Duration::from_millis(1)),
            poll_interval: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn polls_until_idle_and_reports_measurements() {
        let mock = MockController::new()
            .with_rule("STATUS?", MockReply::line("IDLE"))
            .with_rule("IMAGE?", MockReply::line("1,2"));
        mock.script("STATUS?", MockReply::line("SCANNING"));
        mock.script("STATUS?", MockReply::line("BUSY"));

        let queue = Arc::new(TaskQueue::default());
        let mut events = queue.events().subscribe();
        let id = queue.enqueue(Task::from_steps(
            "frame",
            TaskKind::ImageScan,
            vec![
                Step::bare(Operation::StartScan),
                Step::bare(Operation::PollStatus),
                Step::new(
                    Operation::ReadImage,
                    spm_core::CommandArgs::new().with("repetition", 0u32),
                ),
            ],
        ));

        let executor = tokio::spawn(Executor::new(client(&mock), queue.clone(), fast()).run());
        while !queue.is_drained() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        queue.close();
        assert!(!executor.await.unwrap().is_disconnect());

        assert_eq!(queue.status(id), Some(TaskStatus::Completed));
        assert_eq!(mock.sent_matching("STATUS?"), 3);

        let mut measured = None;
        while let Ok(event) = events.try_recv() {
            if let ProgressEvent::Measurement { data, .. } = event {
                measured = Some(data);
            }
        }
        assert_eq!(measured, Some(vec![1.0, 2.0]));
    }

    #[tokio::test]
    async fn controller_fault_fails_without_retry() {
        let mock = MockController::new().with_rule("STATUS?", MockReply::line("ERROR"));
        let queue = Arc::new(TaskQueue::default());
        let id = queue.enqueue(Task::from_steps(
            "frame",
            TaskKind::ImageScan,
            vec![Step::bare(Operation::PollStatus)],
        ));

        let executor = tokio::spawn(Executor::new(client(&mock), queue.clone(), fast()).run());
        while !queue.is_drained() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        queue.close();
        executor.await.unwrap();

        assert_eq!(
            queue.status(id),
            Some(TaskStatus::Failed {
                reason: FailureReason::ControllerFault("ERROR".into())
            })
        );
        assert_eq!(mock.sent_matching("STATUS?"), 1);
    }

    #[tokio::test]
    async fn unknown_template_fails_task_immediately() {
        let mock = MockController::new();
        let queue = Arc::new(TaskQueue::default());
        let id = queue.enqueue(Task::from_steps(
            "bias",
            TaskKind::ImageScan,
            vec![Step::new(
                Operation::SetBias,
                spm_core::CommandArgs::new().with("bias", 1.0),
            )],
        ));

        let executor = tokio::spawn(Executor::new(client(&mock), queue.clone(), fast()).run());
        while !queue.is_drained() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        queue.close();
        executor.await.unwrap();

        assert!(matches!(
            queue.status(id),
            Some(TaskStatus::Failed {
                reason: FailureReason::Command(_)
            })
        ));
        assert!(mock.sent().is_empty());
    }
}
