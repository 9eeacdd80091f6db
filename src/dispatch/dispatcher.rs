//! Task submission and status reads.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::dispatch::queue::{StatusStore, TaskQueue};
use crate::error::QueueError;
use crate::task::{Task, TaskStatus};

/// First retry delay for a failed queue append.
const SUBMIT_BACKOFF_FLOOR: Duration = Duration::from_millis(100);
/// Retry delay ceiling.
const SUBMIT_BACKOFF_CEILING: Duration = Duration::from_secs(30);
/// Attempts before submission gives up with `queue_unavailable`.
const SUBMIT_ATTEMPTS: u32 = 8;

/// Front door of the dispatch fabric: validates tasks, appends them to the
/// stream, and serves read-only status.
pub struct Dispatcher {
    queue: Arc<dyn TaskQueue>,
    status: Arc<dyn StatusStore>,
}

impl Dispatcher {
    pub fn new(queue: Arc<dyn TaskQueue>, status: Arc<dyn StatusStore>) -> Self {
        Self { queue, status }
    }

    /// Submit a task. Returns once the stream has durably accepted it;
    /// a stream outage is retried with exponential backoff before the
    /// failure is surfaced to the caller. Never silently drops.
    pub async fn submit(&self, task: Task) -> Result<Uuid, QueueError> {
        task.validate()
            .map_err(|reason| QueueError::InvalidTask { reason })?;

        let mut backoff = SUBMIT_BACKOFF_FLOOR;
        let mut last_error = None;
        for attempt in 1..=SUBMIT_ATTEMPTS {
            match self.queue.submit(&task).await {
                Ok(()) => {
                    // The pending record is best-effort; workers overwrite
                    // it the moment they claim the entry.
                    if let Err(e) = self.status.put(&TaskStatus::pending(task.task_id)).await {
                        tracing::warn!(task = %task.task_id, "pending status write failed: {e}");
                    }
                    return Ok(task.task_id);
                }
                Err(e) => {
                    tracing::warn!(
                        task = %task.task_id,
                        attempt,
                        "queue submit failed, retrying in {backoff:?}: {e}"
                    );
                    last_error = Some(e);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(SUBMIT_BACKOFF_CEILING);
                }
            }
        }

        Err(last_error.unwrap_or(QueueError::Unavailable {
            reason: "queue submit retries exhausted".to_string(),
        }))
    }

    /// Read-only status view. Unknown ids return `None`.
    pub async fn status(&self, task_id: Uuid) -> Result<Option<TaskStatus>, QueueError> {
        self.status.get(task_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::queue::{InMemoryQueue, InMemoryStatusStore, Lease};
    use crate::task::{TaskState, TaskType};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_submit_returns_id_and_writes_pending() {
        let queue = Arc::new(InMemoryQueue::new());
        let status = Arc::new(InMemoryStatusStore::default());
        let dispatcher = Dispatcher::new(queue.clone(), status);

        let task = Task::new("do it", TaskType::General);
        let task_id = task.task_id;
        assert_eq!(dispatcher.submit(task).await.unwrap(), task_id);

        let recorded = dispatcher.status(task_id).await.unwrap().unwrap();
        assert_eq!(recorded.state, TaskState::Pending);
        assert_eq!(
            queue.depth(TaskType::General).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_task() {
        let dispatcher = Dispatcher::new(
            Arc::new(InMemoryQueue::new()),
            Arc::new(InMemoryStatusStore::default()),
        );
        let err = dispatcher
            .submit(Task::new("x", TaskType::General).with_priority(9))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidTask { .. }));
    }

    /// Queue that fails a fixed number of times before accepting.
    struct FlakyQueue {
        inner: InMemoryQueue,
        failures_left: AtomicU32,
    }

    #[async_trait::async_trait]
    impl TaskQueue for FlakyQueue {
        async fn submit(&self, task: &Task) -> Result<(), QueueError> {
            if self.failures_left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_sub(1)
            }).is_ok()
            {
                return Err(QueueError::Unavailable {
                    reason: "transient".to_string(),
                });
            }
            self.inner.submit(task).await
        }

        async fn claim(
            &self,
            task_type: TaskType,
            wait: Duration,
        ) -> Result<Option<Lease>, QueueError> {
            self.inner.claim(task_type, wait).await
        }

        async fn ack(&self, task_type: TaskType, entry_id: u64) -> Result<(), QueueError> {
            self.inner.ack(task_type, entry_id).await
        }

        async fn depth(&self, task_type: TaskType) -> Result<usize, QueueError> {
            self.inner.depth(task_type).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_retries_through_transient_outage() {
        let queue = Arc::new(FlakyQueue {
            inner: InMemoryQueue::new(),
            failures_left: AtomicU32::new(3),
        });
        let dispatcher = Dispatcher::new(queue.clone(), Arc::new(InMemoryStatusStore::default()));

        let task = Task::new("persist me", TaskType::Code);
        dispatcher.submit(task).await.unwrap();
        assert_eq!(queue.depth(TaskType::Code).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_surfaces_exhaustion() {
        let queue = Arc::new(FlakyQueue {
            inner: InMemoryQueue::new(),
            failures_left: AtomicU32::new(u32::MAX),
        });
        let dispatcher = Dispatcher::new(queue, Arc::new(InMemoryStatusStore::default()));

        let err = dispatcher
            .submit(Task::new("doomed", TaskType::Code))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Unavailable { .. }));
    }
}
