//! Worker pools draining the task queues.
//!
//! Each queue owns its pool; workers pick up one task at a time and never
//! yield mid-task. A transient failure re-enqueues the task with exponential
//! backoff until its attempt budget runs out; permanent failures go straight
//! to the dead-letter store. Cancellation is observed between tasks and
//! inside the rate-limit wait — an in-flight vendor call completes, then the
//! pool drains.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::store::TaskStore;
use super::task::{backoff, QueueName, Task, TaskError, TaskKind};

/// Executes one task. Implemented by the orchestrator's dispatcher.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<(), TaskError>;

    /// Attempt budget per task kind (first try included).
    fn max_attempts(&self, kind: TaskKind) -> u32;
}

/// Success/failure counters for one queue, reported in the exit summary.
#[derive(Debug, Default)]
pub struct QueueStats {
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl QueueStats {
    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Handles of one queue's workers.
pub struct WorkerPool {
    queue: QueueName,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` tasks draining `queue`.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        queue: QueueName,
        workers: usize,
        store: Arc<TaskStore>,
        handler: Arc<dyn TaskHandler>,
        base_delay_ms: u64,
        cancel: CancellationToken,
        notify: Arc<Notify>,
        stats: Arc<QueueStats>,
    ) -> Self {
        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let store = Arc::clone(&store);
            let handler = Arc::clone(&handler);
            let cancel = cancel.clone();
            let notify = Arc::clone(&notify);
            let stats = Arc::clone(&stats);
            handles.push(tokio::spawn(async move {
                worker_loop(
                    queue,
                    worker_id,
                    store,
                    handler,
                    base_delay_ms,
                    cancel,
                    notify,
                    stats,
                )
                .await;
            }));
        }
        info!(queue = %queue, workers, "Worker pool started");
        Self { queue, handles }
    }

    /// Wait for every worker to exit.
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
        debug!(queue = %self.queue, "Worker pool drained");
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    queue: QueueName,
    worker_id: usize,
    store: Arc<TaskStore>,
    handler: Arc<dyn TaskHandler>,
    base_delay_ms: u64,
    cancel: CancellationToken,
    notify: Arc<Notify>,
    stats: Arc<QueueStats>,
) {
    loop {
        if cancel.is_cancelled() {
            debug!(queue = %queue, worker_id, "Worker exiting on cancellation");
            return;
        }

        let task = match store.pop(queue).await {
            Ok(task) => task,
            Err(err) => {
                error!(queue = %queue, error = %err, "Queue store pop failed");
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }
        };

        let Some(task) = task else {
            // Idle: wake on new work, backoff expiry, or cancellation.
            tokio::select! {
                () = notify.notified() => {}
                () = tokio::time::sleep(Duration::from_millis(100)) => {}
                () = cancel.cancelled() => {}
            }
            continue;
        };

        let result = handler.handle(&task).await;
        let finish = match result {
            Ok(()) => {
                stats.succeeded.fetch_add(1, Ordering::Relaxed);
                store.complete(&task, "succeeded").await
            }
            Err(TaskError::Cancelled) => {
                // Cancellation ends the task as a succeeded no-op.
                stats.succeeded.fetch_add(1, Ordering::Relaxed);
                store.complete(&task, "cancelled_noop").await
            }
            Err(err @ TaskError::Transient { .. })
                if task.attempt + 1 < handler.max_attempts(task.kind) =>
            {
                let delay = backoff(task.attempt, base_delay_ms);
                warn!(
                    queue = %queue,
                    task = %task.task_name,
                    correlation_id = %task.correlation_id,
                    attempt = task.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient failure, re-enqueueing with backoff"
                );
                store.retry(&task, delay).await
            }
            Err(err) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    queue = %queue,
                    task = %task.task_name,
                    correlation_id = %task.correlation_id,
                    attempts = task.attempt + 1,
                    error = %err,
                    "Task failed permanently, dead-lettering"
                );
                store.dead_letter(&task, &err).await
            }
        };

        if let Err(err) = finish {
            error!(queue = %queue, error = %err, "Queue store transition failed");
        }
    }
}
