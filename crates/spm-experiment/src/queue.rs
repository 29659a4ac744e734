//! Task Queue / Scheduler.
//!
//! An ordered working set of non-terminal tasks plus a read-only history of
//! terminal ones. The authoring side enqueues, cancels and reorders at any
//! time; the executor takes the head task, reports step progress and
//! finalizes it. Every read-then-mutate sequence happens under one lock, so a
//! cancel racing with the executor picking the same task sees either
//! "still queued" (and removes it) or "running" (and sets the flag), never
//! something in between.
//!
//! Invariants:
//! - at most one task is `Running`, and when there is one it is `active[0]`
//! - tasks in `active` are `Queued` or `Running`; terminal tasks live in `history`
//! - reordering only permutes the queued tail; the running head never moves
//!
//! The queue does no I/O.

use crate::events::{EventBus, ProgressEvent};
use crate::task::{Step, Task, TaskKind, TaskStatus};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use spm_core::{ArgValue, QueueError, TaskId};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Result of a successful `cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task was queued; it is now `Cancelled` and will never run.
    Cancelled,
    /// The task is running; it stops before its next step.
    Requested,
}

/// Read-only view of a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    /// Task identifier
    pub id: TaskId,
    /// Display name
    pub name: String,
    /// Image scan or spectroscopy
    pub kind: TaskKind,
    /// Lifecycle state at snapshot time
    pub status: TaskStatus,
    /// Length of the fixed step list
    pub steps_total: usize,
    /// Steps completed so far
    pub steps_done: usize,
    /// A cancel is pending on the running task
    pub cancel_requested: bool,
    /// Estimated acquisition time
    pub estimated_duration: Duration,
    /// Named task settings, empty for hand-composed tasks
    pub parameters: BTreeMap<String, ArgValue>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Read-only view of the whole queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueSnapshot {
    /// Non-terminal tasks in execution order.
    pub active: Vec<TaskSnapshot>,
    /// Terminal tasks in the order they finished.
    pub history: Vec<TaskSnapshot>,
    /// Whether the queue was paused
    pub paused: bool,
}

impl QueueSnapshot {
    /// The running task, if any.
    pub fn running(&self) -> Option<&TaskSnapshot> {
        self.active
            .first()
            .filter(|t| t.status == TaskStatus::Running)
    }

    /// Tasks still waiting to start.
    pub fn queued(&self) -> impl Iterator<Item = &TaskSnapshot> {
        self.active.iter().filter(|t| t.status == TaskStatus::Queued)
    }

    /// Look a task up in either list.
    pub fn get(&self, id: TaskId) -> Option<&TaskSnapshot> {
        self.active.iter().chain(&self.history).find(|t| t.id == id)
    }
}

/// The task the executor is working on. Carries the fixed step list and the
/// cooperative cancellation flag.
#[derive(Debug, Clone)]
pub struct ActiveTask {
    /// Task identifier
    pub id: TaskId,
    /// Display name
    pub name: String,
    /// Steps to execute, in order
    pub steps: Vec<Step>,
    cancel: Arc<AtomicBool>,
}

impl ActiveTask {
    /// Whether a cancel has been requested since the task started.
    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }
}

struct Entry {
    task: Task,
    steps_done: usize,
    cancel: Arc<AtomicBool>,
}

impl Entry {
    fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.task.id(),
            name: self.task.name().to_string(),
            kind: self.task.kind(),
            status: self.task.status().clone(),
            steps_total: self.task.expand().len(),
            steps_done: self.steps_done,
            cancel_requested: self.cancel.load(Ordering::Acquire),
            estimated_duration: self.task.estimated_duration(),
            parameters: self.task.parameters(),
            created_at: self.task.created_at(),
        }
    }
}

#[derive(Default)]
struct QueueState {
    active: Vec<Entry>,
    history: Vec<Entry>,
    paused: bool,
    closed: bool,
}

impl QueueState {
    fn position(&self, id: TaskId) -> Option<usize> {
        self.active.iter().position(|e| e.task.id() == id)
    }

    fn head_running(&self) -> bool {
        self.active
            .first()
            .is_some_and(|e| *e.task.status() == TaskStatus::Running)
    }

    fn terminal_status(&self, id: TaskId) -> Option<&TaskStatus> {
        self.history
            .iter()
            .find(|e| e.task.id() == id)
            .map(|e| e.task.status())
    }
}

/// Shared, lock-guarded task queue.
pub struct TaskQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    events: EventBus,
}

impl TaskQueue {
    /// Empty queue reporting to `events`.
    pub fn new(events: EventBus) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            events,
        }
    }

    /// Event bus this queue reports to.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Append `task` to the tail. Always succeeds.
    pub fn enqueue(&self, task: Task) -> TaskId {
        let id = task.id();
        let name = task.name().to_string();
        {
            let mut state = self.state.lock();
            state.active.push(Entry {
                task,
                steps_done: 0,
                cancel: Arc::new(AtomicBool::new(false)),
            });
            tracing::info!(task_id = %id, name = %name, queued = state.active.len(), "Task enqueued");
            self.events.emit(ProgressEvent::TaskEnqueued { task_id: id, name });
        }
        self.notify.notify_one();
        id
    }

    /// Cancel a queued task outright, or ask the running task to stop
    /// before its next step.
    pub fn cancel(&self, id: TaskId) -> Result<CancelOutcome, QueueError> {
        let mut state = self.state.lock();
        let Some(index) = state.position(id) else {
            let reason = match state.terminal_status(id) {
                Some(status) => format!("task is already {}", status),
                None => "unknown task".to_string(),
            };
            return Err(QueueError::InvalidCancel { id, reason });
        };

        match state.active[index].task.status().clone() {
            TaskStatus::Queued => {
                let mut entry = state.active.remove(index);
                entry.task.transition(TaskStatus::Cancelled);
                tracing::info!(task_id = %id, "Queued task cancelled");
                self.events.emit(ProgressEvent::StatusChanged {
                    task_id: id,
                    status: TaskStatus::Cancelled,
                });
                state.history.push(entry);
                Ok(CancelOutcome::Cancelled)
            }
            TaskStatus::Running => {
                state.active[index].cancel.store(true, Ordering::Release);
                tracing::info!(task_id = %id, "Cancellation requested for running task");
                Ok(CancelOutcome::Requested)
            }
            other => Err(QueueError::InvalidCancel {
                id,
                reason: format!("task is {}", other),
            }),
        }
    }

    /// Move a queued task to `new_position` among the queued tasks
    /// (0 = next to run).
    pub fn reorder(&self, id: TaskId, new_position: usize) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        let invalid = |reason: String| QueueError::InvalidReorder { id, reason };

        let Some(index) = state.position(id) else {
            return Err(invalid(match state.terminal_status(id) {
                Some(status) => format!("task is already {}", status),
                None => "unknown task".to_string(),
            }));
        };
        let status = state.active[index].task.status();
        if *status != TaskStatus::Queued {
            return Err(invalid(format!("task is {}", status)));
        }

        let offset = usize::from(state.head_running());
        let queued = state.active.len() - offset;
        if new_position >= queued {
            return Err(invalid(format!(
                "position {} out of range (0..{})",
                new_position, queued
            )));
        }

        let entry = state.active.remove(index);
        state.active.insert(offset + new_position, entry);
        tracing::debug!(task_id = %id, position = new_position, "Task reordered");
        Ok(())
    }

    /// The next task that would start, if any.
    pub fn peek_next(&self) -> Option<TaskSnapshot> {
        let state = self.state.lock();
        state
            .active
            .iter()
            .find(|e| *e.task.status() == TaskStatus::Queued)
            .map(Entry::snapshot)
    }

    /// Consistent view of the whole queue.
    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock();
        QueueSnapshot {
            active: state.active.iter().map(Entry::snapshot).collect(),
            history: state.history.iter().map(Entry::snapshot).collect(),
            paused: state.paused,
        }
    }

    /// Current status of a task in either list.
    pub fn status(&self, id: TaskId) -> Option<TaskStatus> {
        let state = self.state.lock();
        state
            .active
            .iter()
            .chain(&state.history)
            .find(|e| e.task.id() == id)
            .map(|e| e.task.status().clone())
    }

    /// Number of non-terminal tasks.
    pub fn active_len(&self) -> usize {
        self.state.lock().active.len()
    }

    /// True when no task is queued or running.
    pub fn is_drained(&self) -> bool {
        self.state.lock().active.is_empty()
    }

    /// Stop handing out tasks. A running task is not affected.
    pub fn pause(&self) {
        let mut state = self.state.lock();
        if !state.paused {
            state.paused = true;
            tracing::info!("Queue paused");
            self.events.emit(ProgressEvent::QueuePaused);
        }
    }

    /// Hand out tasks again.
    pub fn resume(&self) {
        {
            let mut state = self.state.lock();
            if !state.paused {
                return;
            }
            state.paused = false;
            tracing::info!("Queue resumed");
            self.events.emit(ProgressEvent::QueueResumed);
        }
        self.notify.notify_one();
    }

    /// Whether the queue is paused.
    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Wake the executor and make `next_task` return `None` from now on.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }

    /// Whether `close` was called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Atomically mark the head queued task `Running` and hand it out.
    ///
    /// Returns `None` when the queue is paused, closed, empty, or a task is
    /// already running.
    pub fn begin_next(&self) -> Option<ActiveTask> {
        let mut state = self.state.lock();
        if state.paused || state.closed || state.head_running() {
            return None;
        }
        let entry = state.active.first_mut()?;
        if !entry.task.transition(TaskStatus::Running) {
            return None;
        }
        let active = ActiveTask {
            id: entry.task.id(),
            name: entry.task.name().to_string(),
            steps: entry.task.expand().to_vec(),
            cancel: entry.cancel.clone(),
        };
        tracing::info!(task_id = %active.id, name = %active.name, steps = active.steps.len(), "Task started");
        self.events.emit(ProgressEvent::StatusChanged {
            task_id: active.id,
            status: TaskStatus::Running,
        });
        Some(active)
    }

    /// Wait until a task can be started and start it. Returns `None` once
    /// the queue is closed.
    pub async fn next_task(&self) -> Option<ActiveTask> {
        loop {
            let notified = self.notify.notified();
            if self.is_closed() {
                return None;
            }
            if let Some(task) = self.begin_next() {
                return Some(task);
            }
            notified.await;
        }
    }

    /// Record that the running task finished `steps_done` steps.
    pub fn record_progress(&self, id: TaskId, steps_done: usize) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        let index = state.position(id).ok_or(QueueError::UnknownTask(id))?;
        state.active[index].steps_done = steps_done;
        Ok(())
    }

    /// Move the running task to a terminal state and into history.
    pub fn finish(&self, id: TaskId, status: TaskStatus) -> Result<(), QueueError> {
        let notify = {
            let mut state = self.state.lock();
            let index = state.position(id).ok_or(QueueError::UnknownTask(id))?;
            if !state.active[index].task.transition(status.clone()) {
                return Err(QueueError::UnknownTask(id));
            }
            let entry = state.active.remove(index);
            match &status {
                TaskStatus::Failed { reason } => {
                    tracing::warn!(task_id = %id, reason = %reason, "Task failed")
                }
                other => tracing::info!(task_id = %id, status = %other, "Task finished"),
            }
            self.events.emit(ProgressEvent::StatusChanged {
                task_id: id,
                status,
            });
            state.history.push(entry);
            !state.active.is_empty()
        };
        if notify {
            self.notify.notify_one();
        }
        Ok(())
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(EventBus::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spm_core::FailureReason;
    use spm_protocol::Operation;

    fn task(name: &str) -> Task {
        Task::from_steps(
            name,
            TaskKind::ImageScan,
            vec![Step::bare(Operation::StartScan), Step::bare(Operation::PollStatus)],
        )
    }

    fn names(queue: &TaskQueue) -> Vec<String> {
        queue.snapshot().active.into_iter().map(|t| t.name).collect()
    }

    #[test]
    fn enqueue_appends_and_peek_sees_head() {
        let queue = TaskQueue::default();
        let a = queue.enqueue(task("a"));
        queue.enqueue(task("b"));

        assert_eq!(queue.active_len(), 2);
        assert_eq!(queue.peek_next().unwrap().id, a);
        assert_eq!(names(&queue), vec!["a", "b"]);
    }

    #[test]
    fn at_most_one_running() {
        let queue = TaskQueue::default();
        let a = queue.enqueue(task("a"));
        let b = queue.enqueue(task("b"));

        let first = queue.begin_next().unwrap();
        assert_eq!(first.id, a);
        assert!(queue.begin_next().is_none());
        assert_eq!(queue.peek_next().unwrap().id, b);

        queue
            .finish(a, TaskStatus::Completed)
            .unwrap();
        let second = queue.begin_next().unwrap();
        assert_eq!(second.id, b);

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.running().unwrap().id, b);
        assert_eq!(snapshot.history[0].status, TaskStatus::Completed);
    }

    #[test]
    fn cancel_queued_removes_it() {
        let queue = TaskQueue::default();
        let a = queue.enqueue(task("a"));
        let b = queue.enqueue(task("b"));

        assert_eq!(queue.cancel(a).unwrap(), CancelOutcome::Cancelled);
        assert_eq!(queue.status(a), Some(TaskStatus::Cancelled));
        assert_eq!(queue.begin_next().unwrap().id, b);

        let err = queue.cancel(a).unwrap_err();
        assert!(matches!(err, QueueError::InvalidCancel { .. }));
        let err = queue.cancel(TaskId::new()).unwrap_err();
        assert!(matches!(err, QueueError::InvalidCancel { .. }));
    }

    #[test]
    fn cancel_running_sets_flag() {
        let queue = TaskQueue::default();
        let a = queue.enqueue(task("a"));
        let active = queue.begin_next().unwrap();

        assert_eq!(queue.cancel(a).unwrap(), CancelOutcome::Requested);
        assert!(active.cancel_requested());
        // Still running until the executor acknowledges.
        assert_eq!(queue.status(a), Some(TaskStatus::Running));
        assert!(queue.snapshot().active[0].cancel_requested);

        queue.finish(a, TaskStatus::Cancelled).unwrap();
        assert_eq!(queue.status(a), Some(TaskStatus::Cancelled));
    }

    #[test]
    fn reorder_queued_tasks() {
        let queue = TaskQueue::default();
        let a = queue.enqueue(task("a"));
        queue.enqueue(task("b"));
        let c = queue.enqueue(task("c"));

        queue.begin_next().unwrap();
        queue.reorder(c, 0).unwrap();
        assert_eq!(names(&queue), vec!["a", "c", "b"]);

        // The running head cannot move and nothing changes.
        let err = queue.reorder(a, 1).unwrap_err();
        assert!(matches!(err, QueueError::InvalidReorder { .. }));
        assert_eq!(names(&queue), vec!["a", "c", "b"]);

        let err = queue.reorder(c, 2).unwrap_err();
        assert!(matches!(err, QueueError::InvalidReorder { .. }));
        assert_eq!(names(&queue), vec!["a", "c", "b"]);

        queue.finish(a, TaskStatus::Completed).unwrap();
        let err = queue.reorder(a, 0).unwrap_err();
        assert!(matches!(err, QueueError::InvalidReorder { .. }));
        assert!(matches!(
            queue.reorder(TaskId::new(), 0),
            Err(QueueError::InvalidReorder { .. })
        ));
    }

    #[test]
    fn pause_blocks_begin_next() {
        let queue = TaskQueue::default();
        let mut events = queue.events().subscribe();
        queue.enqueue(task("a"));
        queue.pause();
        assert!(queue.begin_next().is_none());
        assert!(queue.snapshot().paused);

        queue.resume();
        assert!(queue.begin_next().is_some());

        let received: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert!(received.contains(&ProgressEvent::QueuePaused));
        assert!(received.contains(&ProgressEvent::QueueResumed));
    }

    #[test]
    fn finish_rejects_unknown_or_illegal() {
        let queue = TaskQueue::default();
        let a = queue.enqueue(task("a"));
        // Not started yet: Queued → Completed is illegal.
        assert!(queue.finish(a, TaskStatus::Completed).is_err());
        assert!(queue.finish(TaskId::new(), TaskStatus::Completed).is_err());

        queue.begin_next().unwrap();
        queue
            .finish(
                a,
                TaskStatus::Failed {
                    reason: FailureReason::Timeout,
                },
            )
            .unwrap();
        assert!(queue.finish(a, TaskStatus::Completed).is_err());
    }

    #[tokio::test]
    async fn next_task_waits_for_enqueue() {
        let queue = Arc::new(TaskQueue::default());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next_task().await.map(|t| t.name) })
        };
        tokio::task::yield_now().await;
        queue.enqueue(task("late"));
        assert_eq!(waiter.await.unwrap(), Some("late".to_string()));
    }

    #[tokio::test]
    async fn close_wakes_waiter() {
        let queue = Arc::new(TaskQueue::default());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next_task().await.is_none() })
        };
        tokio::task::yield_now().await;
        queue.close();
        assert!(waiter.await.unwrap());
    }
}
