use crate::sequence::Sequence;
use crate::task::TaskPriority;
use crate::worker::SchedulerWorker;
use std::sync::Arc;
use std::time::Duration;

/// Callbacks a [`SchedulerWorker`] makes into its owner.
///
/// Every method is called on the worker's own thread, and never from two
/// threads at once: a detached thread stops calling into its delegate before
/// a replacement thread can be created.
pub(crate) trait SchedulerWorkerDelegate: Send + Sync + 'static {
    /// Called once per thread, before any other method. `detach_duration` is
    /// how long the worker went without a thread, `Duration::MAX` if it never
    /// had one before.
    fn on_main_entry(&self, worker: &SchedulerWorker, detach_duration: Duration);

    /// Returns the sequence to run next, `None` if there is no work.
    fn get_work(&self, worker: &SchedulerWorker) -> Option<Arc<Sequence>>;

    /// Called after a task ran. `latency` is the time between post and start.
    fn did_run_task_with_priority(&self, priority: TaskPriority, latency: Duration);

    /// Receives `sequence` back after one of its tasks ran, when it still
    /// holds tasks.
    fn re_enqueue_sequence(&self, sequence: Arc<Sequence>);

    /// Longest a thread sleeps without being woken up. `Duration::MAX` sleeps
    /// until woken up.
    fn get_sleep_timeout(&self) -> Duration;

    /// Whether the thread may exit now that `get_work` returned `None`.
    fn can_detach(&self, worker: &SchedulerWorker) -> bool;

    /// Called right before the thread is released, under the worker's
    /// thread lock.
    fn on_detach(&self) {}

    /// Name given to each OS thread spawned for `worker`.
    fn thread_name(&self, worker: &SchedulerWorker) -> String {
        format!("threadline-{}", worker.id())
    }
}
