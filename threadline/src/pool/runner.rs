use crate::context;
use crate::errors::PostTaskError;
use crate::pool::SchedulerWorkerPool;
use crate::sequence::Sequence;
use crate::task::{Closure, Location, PoolId, Task, TaskTraits, WorkerId};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// A handle to post tasks with fixed traits and ordering guarantees.
///
/// This trait is object safe, [`TaskRunnerExt`] adds the ergonomic generic
/// entry points on top of it.
pub trait TaskRunner: Send + Sync + 'static {
    /// Posts `closure` to run after `delay`. On success the closure eventually
    /// runs, unless shutdown skips it.
    fn post_delayed_task_from(
        &self,
        posted_from: Location,
        closure: Closure,
        delay: Duration,
    ) -> Result<(), PostTaskError>;

    /// Whether the current thread is one this runner's tasks may run on,
    /// within the ordering the runner guarantees.
    fn runs_tasks_on_current_thread(&self) -> bool;
}

pub trait TaskRunnerExt: TaskRunner {
    #[track_caller]
    fn post_task<F>(&self, f: F) -> Result<(), PostTaskError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_delayed_task_from(std::panic::Location::caller(), Box::new(f), Duration::ZERO)
    }

    #[track_caller]
    fn post_delayed_task<F>(&self, f: F, delay: Duration) -> Result<(), PostTaskError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_delayed_task_from(std::panic::Location::caller(), Box::new(f), delay)
    }
}

impl<T: TaskRunner + ?Sized> TaskRunnerExt for T {}

/// Every post gets a fresh sequence, so tasks may run concurrently.
pub(crate) struct ParallelTaskRunner {
    traits: TaskTraits,
    pool: Weak<SchedulerWorkerPool>,
    pool_id: PoolId,
}

impl ParallelTaskRunner {
    pub(crate) fn new(traits: TaskTraits, pool: &Arc<SchedulerWorkerPool>) -> Arc<Self> {
        Arc::new(Self {
            traits,
            pool: Arc::downgrade(pool),
            pool_id: pool.id(),
        })
    }
}

impl TaskRunner for ParallelTaskRunner {
    fn post_delayed_task_from(
        &self,
        posted_from: Location,
        closure: Closure,
        delay: Duration,
    ) -> Result<(), PostTaskError> {
        let pool = self.pool.upgrade().ok_or(PostTaskError::SchedulerGone)?;
        let task = Task::new(posted_from, closure, self.traits, delay);

        pool.post_task_with_sequence(task, Arc::new(Sequence::new()), None)
    }

    fn runs_tasks_on_current_thread(&self) -> bool {
        context::current_pool() == Some(self.pool_id)
    }
}

/// Posts into one sequence owned by the runner.
pub(crate) struct SequencedTaskRunner {
    traits: TaskTraits,
    sequence: Arc<Sequence>,
    pool: Weak<SchedulerWorkerPool>,
    this: Weak<SequencedTaskRunner>,
}

impl SequencedTaskRunner {
    pub(crate) fn new(traits: TaskTraits, pool: &Arc<SchedulerWorkerPool>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            traits,
            sequence: Arc::new(Sequence::new()),
            pool: Arc::downgrade(pool),
            this: this.clone(),
        })
    }
}

impl TaskRunner for SequencedTaskRunner {
    fn post_delayed_task_from(
        &self,
        posted_from: Location,
        closure: Closure,
        delay: Duration,
    ) -> Result<(), PostTaskError> {
        let pool = self.pool.upgrade().ok_or(PostTaskError::SchedulerGone)?;

        let mut task = Task::new(posted_from, closure, self.traits, delay);
        if let Some(this) = self.this.upgrade() {
            task = task.with_runner(this);
        }

        pool.post_task_with_sequence(task, Arc::clone(&self.sequence), None)
    }

    fn runs_tasks_on_current_thread(&self) -> bool {
        context::current_sequence_token() == Some(self.sequence.token())
    }
}

/// Posts into one sequence bound to a single worker of the pool. That worker
/// keeps its thread for as long as the runner exists.
pub(crate) struct SingleThreadTaskRunner {
    traits: TaskTraits,
    sequence: Arc<Sequence>,
    pool: Weak<SchedulerWorkerPool>,
    worker_index: usize,
    worker_id: WorkerId,
    this: Weak<SingleThreadTaskRunner>,
}

impl SingleThreadTaskRunner {
    pub(crate) fn new(traits: TaskTraits, pool: &Arc<SchedulerWorkerPool>) -> Arc<Self> {
        let (worker_index, worker_id) = pool.bind_single_threaded_runner();

        Arc::new_cyclic(|this| Self {
            traits,
            sequence: Arc::new(Sequence::new()),
            pool: Arc::downgrade(pool),
            worker_index,
            worker_id,
            this: this.clone(),
        })
    }
}

impl TaskRunner for SingleThreadTaskRunner {
    fn post_delayed_task_from(
        &self,
        posted_from: Location,
        closure: Closure,
        delay: Duration,
    ) -> Result<(), PostTaskError> {
        let pool = self.pool.upgrade().ok_or(PostTaskError::SchedulerGone)?;

        let mut task = Task::new(posted_from, closure, self.traits, delay);
        if let Some(this) = self.this.upgrade() {
            task = task.with_runner(this);
        }

        pool.post_task_with_sequence(task, Arc::clone(&self.sequence), Some(self.worker_index))
    }

    fn runs_tasks_on_current_thread(&self) -> bool {
        context::current_worker() == Some(self.worker_id)
    }
}

impl Drop for SingleThreadTaskRunner {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.unbind_single_threaded_runner(self.worker_index);
        }
    }
}
