use crate::pool::TaskRunner;
use crate::task::{TaskShutdownBehavior, TaskTraits};
use crate::utils::time::deadline_after;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Where a task was posted from, captured with `#[track_caller]`.
pub type Location = &'static std::panic::Location<'static>;

/// The body of a task.
pub type Closure = Box<dyn FnOnce() + Send + 'static>;

/// A unit of work plus the metadata needed to schedule it.
///
/// Owned by exactly one [`Sequence`](crate::sequence::Sequence) between post
/// and execution, then consumed by [`TaskTracker::run_task`].
///
/// [`TaskTracker::run_task`]: crate::task_tracker::TaskTracker::run_task
pub(crate) struct Task {
    pub(crate) posted_from: Location,
    pub(crate) closure: Closure,
    pub(crate) traits: TaskTraits,
    pub(crate) delay: Duration,

    /// Stamped when the task is pushed into its sequence.
    pub(crate) sequenced_time: Instant,

    /// `None` for undelayed tasks.
    pub(crate) delayed_run_time: Option<Instant>,

    /// Exposed as the current task runner while the task runs. Only set by
    /// sequenced and single-threaded runners.
    pub(crate) runner: Option<Arc<dyn TaskRunner>>,
}

impl Task {
    pub(crate) fn new(
        posted_from: Location,
        closure: Closure,
        traits: TaskTraits,
        delay: Duration,
    ) -> Self {
        let now = Instant::now();

        // A delayed task could otherwise prevent shutdown from completing until
        // its delay expires.
        let traits = if !delay.is_zero()
            && traits.shutdown_behavior() == TaskShutdownBehavior::BlockShutdown
        {
            traits.with_shutdown_behavior(TaskShutdownBehavior::SkipOnShutdown)
        } else {
            traits
        };

        let delayed_run_time = (!delay.is_zero()).then(|| deadline_after(now, delay));

        Self {
            posted_from,
            closure,
            traits,
            delay,
            sequenced_time: now,
            delayed_run_time,
            runner: None,
        }
    }

    pub(crate) fn with_runner(mut self, runner: Arc<dyn TaskRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub(crate) fn is_delayed(&self) -> bool {
        self.delayed_run_time.is_some()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("posted_from", &self.posted_from)
            .field("traits", &self.traits)
            .field("delay", &self.delay)
            .field("sequenced_time", &self.sequenced_time)
            .field("delayed_run_time", &self.delayed_run_time)
            .field("has_runner", &self.runner.is_some())
            .finish()
    }
}
