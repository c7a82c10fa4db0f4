use crate::delayed::ServiceThread;
use crate::task::Task;
use crate::task_tracker::TaskTracker;
use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Hands a delayed task back to the regular posting path.
pub(crate) type PostTaskNowCallback = Box<dyn FnOnce(Task) + Send + 'static>;

/// Holds delayed tasks until their run time, on the service thread.
///
/// Tasks reaching this point were already admitted by the task tracker.
pub(crate) struct DelayedTaskManager {
    service_thread: ServiceThread,
    task_tracker: Arc<TaskTracker>,
}

/// A task waiting on the service thread. Reported as skipped if it is
/// dropped before being forwarded.
struct PendingTask {
    task: Option<Task>,
    task_tracker: Arc<TaskTracker>,
}

impl Drop for PendingTask {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            self.task_tracker.drop_task(task);
        }
    }
}

impl DelayedTaskManager {
    pub(crate) fn try_new(
        service_thread_name: impl Into<String>,
        task_tracker: Arc<TaskTracker>,
    ) -> Result<Self> {
        Ok(Self {
            service_thread: ServiceThread::try_new(service_thread_name)?,
            task_tracker,
        })
    }

    /// Calls `post_task_now(task)` on the service thread once
    /// `task.delayed_run_time` is reached.
    pub(crate) fn add_delayed_task(&self, task: Task, post_task_now: PostTaskNowCallback) {
        let delay = task
            .delayed_run_time
            .map_or(Duration::ZERO, |at| at.saturating_duration_since(Instant::now()));
        let posted_from = task.posted_from;

        let mut pending = PendingTask {
            task: Some(task),
            task_tracker: Arc::clone(&self.task_tracker),
        };

        if !self.service_thread.post_delayed(
            Box::new(move || {
                if let Some(task) = pending.task.take() {
                    post_task_now(task);
                }
            }),
            delay,
        ) {
            debug!(%posted_from, "delayed task dropped: service thread stopped");
        }
    }

    pub(crate) fn stop(&self) {
        self.service_thread.stop();
    }

    #[cfg(test)]
    pub(crate) fn num_pending_for_testing(&self) -> usize {
        self.service_thread.num_pending_for_testing()
    }
}
