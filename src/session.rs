//! Session: one controller connection, one task queue, one executor.
//!
//! The session is what a frontend talks to. It owns the executor task and
//! exposes the scheduler operations of [`TaskQueue`] plus the lifecycle
//! around them:
//!
//! - [`Session::start`] connects to the controller named in the configuration
//!   and spawns the executor.
//! - [`Session::is_halted`] reports an executor that stopped after losing the
//!   connection. The queue is left untouched.
//! - [`Session::reconnect`] reopens the connection and resumes the same queue.
//! - [`Session::shutdown`] closes the queue, cancels the running task, stops
//!   the executor and closes the connection.

use crate::config::AppConfig;
use spm_core::{AppResult, QueueError, SpmError, TaskId};
use spm_experiment::{
    CancelOutcome, EventBus, Executor, ExecutorConfig, ExecutorExit, ProgressEvent,
    QueueSnapshot, Task, TaskQueue, TaskSnapshot,
};
use spm_protocol::{Operation, ProtocolClient, TcpChannel, TemplateRegistry, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// How often `wait_idle` re-checks the queue when no event arrives.
const IDLE_CHECK_INTERVAL: Duration = Duration::from_millis(200);

/// A running sequencer.
pub struct Session<T: Transport + 'static> {
    queue: Arc<TaskQueue>,
    executor_config: ExecutorConfig,
    executor: Option<JoinHandle<ExecutorExit<T>>>,
    /// Client handed back by a halted executor, waiting for `reconnect`.
    idle_client: Option<ProtocolClient<T>>,
}

impl Session<TcpChannel> {
    /// Load templates, connect to the controller and start executing.
    ///
    /// Template files with structural problems abort startup. Operations with
    /// no template only produce a warning; tasks that need them fail when
    /// they reach that step.
    pub async fn start(config: &AppConfig) -> AppResult<Self> {
        let templates = config.load_templates()?;
        let missing = templates.missing(Operation::names());
        if !missing.is_empty() {
            warn!(missing = ?missing, "Command templates missing for some operations");
        }

        let transport = TcpChannel::connect(config.controller.address(), config.channel_config())
            .await?;

        Ok(Self::with_transport(
            templates,
            transport,
            config.executor_config(),
            config.executor.event_capacity,
        ))
    }
}

impl<T: Transport + 'static> Session<T> {
    /// Start a session over an already-open transport.
    pub fn with_transport(
        templates: TemplateRegistry,
        transport: T,
        executor_config: ExecutorConfig,
        event_capacity: usize,
    ) -> Self {
        let queue = Arc::new(TaskQueue::new(EventBus::new(event_capacity)));
        let client = ProtocolClient::new(Arc::new(templates), transport);
        let mut session = Self {
            queue,
            executor_config,
            executor: None,
            idle_client: None,
        };
        session.spawn_executor(client);
        session
    }

    fn spawn_executor(&mut self, client: ProtocolClient<T>) {
        let executor = Executor::new(client, self.queue.clone(), self.executor_config.clone());
        self.executor = Some(tokio::spawn(executor.run()));
    }

    /// The shared queue.
    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Append a task to the tail of the queue.
    pub fn enqueue(&self, task: Task) -> TaskId {
        self.queue.enqueue(task)
    }

    /// Append tasks in order.
    pub fn enqueue_all(&self, tasks: impl IntoIterator<Item = Task>) -> Vec<TaskId> {
        tasks.into_iter().map(|t| self.queue.enqueue(t)).collect()
    }

    /// Cancel a queued task, or request cancellation of the running one.
    pub fn cancel(&self, id: TaskId) -> Result<CancelOutcome, QueueError> {
        self.queue.cancel(id)
    }

    /// Move a queued task to `new_position` among the queued tasks.
    pub fn reorder(&self, id: TaskId, new_position: usize) -> Result<(), QueueError> {
        self.queue.reorder(id, new_position)
    }

    /// Consistent view of the queue.
    pub fn snapshot(&self) -> QueueSnapshot {
        self.queue.snapshot()
    }

    /// The task that would start next.
    pub fn peek_next(&self) -> Option<TaskSnapshot> {
        self.queue.peek_next()
    }

    /// Progress events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.queue.events().subscribe()
    }

    /// Stop starting new tasks. The running task continues.
    pub fn pause(&self) {
        self.queue.pause();
    }

    /// Start handing out tasks again.
    pub fn resume(&self) {
        self.queue.resume();
    }

    /// Estimated time to run everything still queued, saturating at
    /// [`Duration::MAX`].
    pub fn remaining_estimate(&self) -> Duration {
        self.queue
            .snapshot()
            .queued()
            .map(|t| t.estimated_duration)
            .fold(Duration::ZERO, Duration::saturating_add)
    }

    /// True when the executor has stopped, i.e. after a lost connection.
    pub fn is_halted(&self) -> bool {
        match &self.executor {
            Some(handle) => handle.is_finished(),
            None => true,
        }
    }

    /// Wait until every task has reached a terminal state or the executor
    /// halts.
    pub async fn wait_idle(&self) {
        let mut events = self.subscribe();
        loop {
            if self.queue.is_drained() || self.is_halted() {
                return;
            }
            // A disconnect event precedes the executor actually finishing,
            // so only the handle state counts as halted.
            if let Ok(Err(broadcast::error::RecvError::Closed)) =
                tokio::time::timeout(IDLE_CHECK_INTERVAL, events.recv()).await
            {
                return;
            }
        }
    }

    /// Collect the client of a stopped executor.
    async fn reclaim(&mut self) -> AppResult<()> {
        if let Some(handle) = self.executor.take() {
            let exit = handle
                .await
                .map_err(|e| SpmError::Executor(e.to_string()))?;
            if let ExecutorExit::Disconnected { reason, .. } = &exit {
                info!(reason = %reason, "Executor halted");
            }
            self.idle_client = Some(exit.into_client());
        }
        Ok(())
    }

    /// Reopen the controller connection after a halt and resume the queue.
    ///
    /// Fails without side effects while the executor is still running.
    pub async fn reconnect(&mut self) -> AppResult<()> {
        if !self.is_halted() {
            return Err(SpmError::Executor(
                "executor is still running; nothing to reconnect".into(),
            ));
        }
        self.reclaim().await?;
        let mut client = self
            .idle_client
            .take()
            .ok_or_else(|| SpmError::Executor("no client to reconnect".into()))?;

        if let Err(e) = client.reconnect().await {
            self.idle_client = Some(client);
            return Err(e.into());
        }
        info!("Controller reconnected, resuming queue");
        self.spawn_executor(client);
        Ok(())
    }

    /// Close the queue, cancel the running task, stop the executor and close
    /// the connection.
    ///
    /// Queued tasks stay queued; they are reported in the final snapshot.
    pub async fn shutdown(mut self) -> AppResult<QueueSnapshot> {
        // Close before cancelling: nothing may start after the running task.
        self.queue.close();
        if let Some(running) = self.queue.snapshot().running() {
            if let Err(e) = self.queue.cancel(running.id) {
                warn!(task_id = %running.id, error = %e, "Could not cancel running task");
            }
        }
        self.reclaim().await?;
        if let Some(client) = self.idle_client.take() {
            client.close().await;
        }
        info!("Session closed");
        Ok(self.queue.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spm_core::RetryPolicy;
    use spm_experiment::TaskStatus;
    use spm_protocol::{MockController, MockReply};

    fn templates() -> TemplateRegistry {
        TemplateRegistry::from_entries([
            ("set_bias", "BIAS ${bias}"),
            ("start_scan", "SCAN START"),
            ("poll_status", "STATUS?"),
        ])
        .unwrap()
    }

    fn config() -> ExecutorConfig {
        ExecutorConfig {
            retry: RetryPolicy::new(1, Duration::from_millis(5)),
            poll_interval: Duration::from_millis(5),
        }
    }

    fn task(name: &str) -> Task {
        use spm_core::CommandArgs;
        use spm_experiment::{Step, TaskKind};
        let args = CommandArgs::new().with("bias", 1.0);
        Task::from_steps(
            name,
            TaskKind::ImageScan,
            vec![
                Step::new(Operation::SetBias, args),
                Step::bare(Operation::StartScan),
                Step::bare(Operation::PollStatus),
            ],
        )
    }

    #[tokio::test]
    async fn test_runs_and_shuts_down() {
        let mock = MockController::simulated();
        let session = Session::with_transport(templates(), mock.clone(), config(), 64);

        let id = session.enqueue(task("a"));
        tokio::time::timeout(Duration::from_secs(5), session.wait_idle())
            .await
            .unwrap();

        let snapshot = session.shutdown().await.unwrap();
        assert_eq!(snapshot.get(id).unwrap().status, TaskStatus::Completed);
        assert_eq!(mock.sent(), vec!["BIAS 1", "SCAN START", "STATUS?"]);
    }

    #[tokio::test]
    async fn test_halt_and_reconnect() {
        let mock = MockController::simulated();
        mock.script("BIAS", MockReply::Disconnect);
        let mut session = Session::with_transport(templates(), mock.clone(), config(), 64);

        let first = session.enqueue(task("a"));
        let second = session.enqueue(task("b"));
        tokio::time::timeout(Duration::from_secs(5), session.wait_idle())
            .await
            .unwrap();

        assert!(session.is_halted());
        assert!(matches!(
            session.snapshot().get(first).unwrap().status,
            TaskStatus::Failed { .. }
        ));
        assert_eq!(session.snapshot().get(second).unwrap().status, TaskStatus::Queued);

        session.reconnect().await.unwrap();
        assert_eq!(mock.reconnect_count(), 1);
        tokio::time::timeout(Duration::from_secs(5), session.wait_idle())
            .await
            .unwrap();
        let snapshot = session.shutdown().await.unwrap();
        assert_eq!(snapshot.get(second).unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_shutdown_starts_nothing_after_running_task() {
        let mock = MockController::simulated();
        mock.script("BIAS", MockReply::Delayed(Duration::from_millis(100), "0".into()));
        let session = Session::with_transport(templates(), mock.clone(), config(), 64);

        let first = session.enqueue(task("a"));
        let second = session.enqueue(task("b"));
        tokio::time::timeout(Duration::from_secs(5), async {
            while mock.sent_matching("BIAS") == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        let snapshot = session.shutdown().await.unwrap();
        assert_eq!(snapshot.get(first).unwrap().status, TaskStatus::Cancelled);
        assert_eq!(snapshot.get(second).unwrap().status, TaskStatus::Queued);
        assert_eq!(mock.sent(), vec!["BIAS 1"]);
    }

    #[tokio::test]
    async fn test_remaining_estimate_saturates() {
        use spm_experiment::ImageScanParams;
        let session = Session::with_transport(templates(), MockController::simulated(), config(), 64);
        session.pause();

        let params = ImageScanParams {
            size: 1e-7,
            x_offset: 0.0,
            y_offset: 0.0,
            bias: 0.1,
            set_point: 1e-10,
            line_time: 1e16,
            lines_per_frame: 500,
            repetitions: 1,
        };
        session.enqueue(Task::image_scan("slow a", params.clone()).unwrap());
        session.enqueue(Task::image_scan("slow b", params).unwrap());

        assert_eq!(session.remaining_estimate(), Duration::MAX);
        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_refused_while_running() {
        let session_mock = MockController::simulated();
        let mut session = Session::with_transport(templates(), session_mock, config(), 64);
        assert!(!session.is_halted());
        assert!(matches!(
            session.reconnect().await,
            Err(SpmError::Executor(_))
        ));
        session.shutdown().await.unwrap();
    }
}
