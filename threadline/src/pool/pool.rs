use crate::context;
use crate::delayed::DelayedTaskManager;
use crate::errors::{PostTaskError, SchedulerError};
use crate::pool::metrics::{PoolMetrics, PoolStats};
use crate::pool::runner::{
    ParallelTaskRunner, SequencedTaskRunner, SingleThreadTaskRunner, TaskRunner,
};
use crate::pool::stack::SchedulerWorkerStack;
use crate::pool::{SchedulerWorkerPoolParams, StandbyThreadPolicy};
use crate::sequence::{PriorityQueue, Sequence, SortKey};
use crate::task::{ExecutionMode, PoolId, Task, TaskPriority, TaskTraits, WorkerId};
use crate::task_tracker::TaskTracker;
use crate::worker::{InitialState, SchedulerWorker, SchedulerWorkerDelegate};
use anyhow::{Result, anyhow};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

/// Called with a sequence that still holds tasks after one of them ran on a
/// worker of the pool. Decides which pool gets it next.
pub(crate) type ReEnqueueSequenceCallback = Arc<dyn Fn(Arc<Sequence>) + Send + Sync + 'static>;

/// A fixed set of workers sharing one priority queue of sequences.
pub(crate) struct SchedulerWorkerPool {
    id: PoolId,
    name: String,
    suggested_reclaim_time: Duration,

    shared_priority_queue: PriorityQueue,

    /// Workers with nothing to do. Lock after `shared_priority_queue` when
    /// both are needed.
    idle_workers: Mutex<SchedulerWorkerStack>,
    idle_workers_cv_for_testing: Condvar,

    /// Set once, right after the workers were created.
    workers: OnceLock<Vec<WorkerEntry>>,

    /// Round-robin cursor binding single-threaded runners to workers.
    next_single_threaded_worker: AtomicUsize,

    re_enqueue_sequence_callback: ReEnqueueSequenceCallback,
    task_tracker: Arc<TaskTracker>,
    delayed_task_manager: Arc<DelayedTaskManager>,

    worker_detachment_disallowed: AtomicBool,
    joined: AtomicBool,

    metrics: PoolMetrics,
}

struct WorkerEntry {
    worker: Arc<SchedulerWorker>,
    state: Arc<WorkerState>,
}

/// Per-worker state the pool needs to reach from other threads.
#[derive(Debug, Default)]
struct WorkerState {
    index: usize,

    /// Sequences of the single-threaded runners bound to this worker.
    single_threaded_priority_queue: PriorityQueue,
    num_single_threaded_runners: AtomicUsize,
}

impl SchedulerWorkerPool {
    /// Creates the pool and its `max_threads` workers. Fails if any worker
    /// thread required by the standby policy cannot be spawned.
    pub(crate) fn try_new(
        params: &SchedulerWorkerPoolParams,
        re_enqueue_sequence_callback: ReEnqueueSequenceCallback,
        task_tracker: Arc<TaskTracker>,
        delayed_task_manager: Arc<DelayedTaskManager>,
    ) -> Result<Arc<Self>> {
        if params.max_threads() == 0 {
            return Err(SchedulerError::InvalidConfig(format!(
                "pool {} must have at least one thread",
                params.name()
            ))
            .into());
        }

        let pool = Arc::new(Self {
            id: PoolId::next(),
            name: params.name().to_string(),
            suggested_reclaim_time: params.get_suggested_reclaim_time(),
            shared_priority_queue: PriorityQueue::new(),
            idle_workers: Mutex::new(SchedulerWorkerStack::new()),
            idle_workers_cv_for_testing: Condvar::new(),
            workers: OnceLock::new(),
            next_single_threaded_worker: AtomicUsize::new(0),
            re_enqueue_sequence_callback,
            task_tracker,
            delayed_task_manager,
            worker_detachment_disallowed: AtomicBool::new(false),
            joined: AtomicBool::new(false),
            metrics: PoolMetrics::default(),
        });

        pool.initialize(params)?;

        debug!(
            pool = %pool.name,
            max_threads = params.max_threads(),
            priority = ?params.get_priority_hint(),
            standby = ?params.get_standby_thread_policy(),
            "worker pool started"
        );

        Ok(pool)
    }

    fn initialize(self: &Arc<Self>, params: &SchedulerWorkerPoolParams) -> Result<()> {
        let max_threads = params.max_threads();
        let mut entries = Vec::with_capacity(max_threads);

        // Created from the last index down so that worker 0 ends up on top of
        // the idle stack and is the first one woken up.
        for index in (0..max_threads).rev() {
            let initial_state = match params.get_standby_thread_policy() {
                StandbyThreadPolicy::All => InitialState::Alive,
                StandbyThreadPolicy::One if index == 0 => InitialState::Alive,
                StandbyThreadPolicy::One | StandbyThreadPolicy::Lazy => InitialState::Detached,
            };

            let state = Arc::new(WorkerState {
                index,
                ..Default::default()
            });

            let delegate = WorkerDelegate {
                pool: Arc::downgrade(self),
                state: Arc::clone(&state),
                local: Mutex::new(DelegateLocal::default()),
            };

            match SchedulerWorker::try_new(
                params.get_priority_hint(),
                Box::new(delegate),
                Arc::clone(&self.task_tracker),
                initial_state,
            ) {
                Ok(worker) => {
                    self.idle_workers.lock().push(index);
                    entries.push(WorkerEntry { worker, state });
                }
                Err(e) => {
                    for entry in &entries {
                        if let Err(e) = entry.worker.join_for_testing() {
                            error!(pool = %self.name, error = %e, "failed to join worker after spawn failure");
                        }
                    }
                    return Err(e.context(format!("failed to start pool {}", self.name)));
                }
            }
        }

        entries.reverse();
        self.workers
            .set(entries)
            .map_err(|_| anyhow!("pool {} initialized twice", self.name))
    }

    pub(crate) fn id(&self) -> PoolId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    fn workers(&self) -> &[WorkerEntry] {
        self.workers.get().map_or(&[], Vec::as_slice)
    }

    /// Returns a runner posting into this pool with the ordering of `mode`.
    pub(crate) fn create_task_runner_with_traits(
        self: &Arc<Self>,
        traits: TaskTraits,
        mode: ExecutionMode,
    ) -> Arc<dyn TaskRunner> {
        match mode {
            ExecutionMode::Parallel => ParallelTaskRunner::new(traits, self),
            ExecutionMode::Sequenced => SequencedTaskRunner::new(traits, self),
            ExecutionMode::SingleThreaded => SingleThreadTaskRunner::new(traits, self),
        }
    }

    /// Admits `task` and queues it in `sequence`. `worker` is the index of
    /// the worker a single-threaded sequence is bound to.
    pub(crate) fn post_task_with_sequence(
        self: &Arc<Self>,
        task: Task,
        sequence: Arc<Sequence>,
        worker: Option<usize>,
    ) -> Result<(), PostTaskError> {
        if self.joined.load(Ordering::Acquire) {
            return Err(PostTaskError::SchedulerGone);
        }

        if !self.task_tracker.will_post_task(&task) {
            let location = task.posted_from;
            return Err(if self.task_tracker.is_shutdown_complete() {
                PostTaskError::ShutdownComplete { location }
            } else {
                PostTaskError::ShutdownStarted { location }
            });
        }

        if task.is_delayed() {
            let pool = Arc::downgrade(self);
            let task_tracker = Arc::clone(&self.task_tracker);
            self.delayed_task_manager.add_delayed_task(
                task,
                Box::new(move |task| match pool.upgrade() {
                    Some(pool) => pool.post_task_with_sequence_now(task, sequence, worker),
                    None => task_tracker.drop_task(task),
                }),
            );
        } else {
            self.post_task_with_sequence_now(task, sequence, worker);
        }

        Ok(())
    }

    /// Queues an admitted task whose delay, if any, expired.
    fn post_task_with_sequence_now(&self, task: Task, sequence: Arc<Sequence>, worker: Option<usize>) {
        debug_assert!(
            task.delayed_run_time
                .is_none_or(|run_time| run_time <= Instant::now())
        );

        let entry = worker.and_then(|index| self.workers().get(index));
        let priority_queue = entry.map_or(&self.shared_priority_queue, |entry| {
            &entry.state.single_threaded_priority_queue
        });

        // Otherwise the sequence is already in a priority queue, or a worker
        // is running its front task and will re-enqueue it.
        if sequence.push_task(task) {
            let sort_key = sequence.sort_key();
            priority_queue.begin_transaction().push(sequence, sort_key);

            match entry {
                Some(entry) => entry.worker.wake_up(),
                None => self.wake_up_one_worker(),
            }
        }
    }

    /// Puts `sequence` back in the shared priority queue.
    pub(crate) fn re_enqueue_sequence(&self, sequence: Arc<Sequence>, sort_key: SortKey) {
        self.shared_priority_queue
            .begin_transaction()
            .push(sequence, sort_key);

        // A worker of this pool is about to call `get_work` anyway.
        if context::current_pool() != Some(self.id) {
            self.wake_up_one_worker();
        }
    }

    fn wake_up_one_worker(&self) {
        let index = self.idle_workers.lock().pop();

        if let Some(entry) = index.and_then(|index| self.workers().get(index)) {
            entry.worker.wake_up();
        }
    }

    fn add_to_idle_workers_stack(&self, index: usize) {
        let mut idle_workers = self.idle_workers.lock();
        if !idle_workers.contains(index) {
            idle_workers.push(index);
        }
        self.idle_workers_cv_for_testing.notify_all();
    }

    fn remove_from_idle_workers_stack(&self, index: usize) {
        self.idle_workers.lock().remove(index);
    }

    fn peek_at_idle_workers_stack(&self) -> Option<usize> {
        self.idle_workers.lock().peek()
    }

    pub(crate) fn bind_single_threaded_runner(&self) -> (usize, WorkerId) {
        let workers = self.workers();
        debug_assert!(!workers.is_empty());

        let index = self
            .next_single_threaded_worker
            .fetch_add(1, Ordering::Relaxed)
            % workers.len();

        let entry = &workers[index];
        entry
            .state
            .num_single_threaded_runners
            .fetch_add(1, Ordering::AcqRel);

        (index, entry.worker.id())
    }

    pub(crate) fn unbind_single_threaded_runner(&self, index: usize) {
        if let Some(entry) = self.workers().get(index) {
            entry
                .state
                .num_single_threaded_runners
                .fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Blocks until every worker is on the idle stack.
    #[cfg(test)]
    pub(crate) fn wait_for_all_workers_idle_for_testing(&self) {
        let num_workers = self.workers().len();
        let mut idle_workers = self.idle_workers.lock();
        while idle_workers.len() < num_workers {
            self.idle_workers_cv_for_testing.wait(&mut idle_workers);
        }
    }

    #[cfg(test)]
    pub(crate) fn disallow_worker_detachment_for_testing(&self) {
        self.worker_detachment_disallowed
            .store(true, Ordering::Release);
    }

    pub(crate) fn num_alive_workers(&self) -> usize {
        self.workers()
            .iter()
            .filter(|entry| entry.worker.thread_alive_for_testing())
            .count()
    }

    pub(crate) fn stats(&self) -> PoolStats {
        PoolStats::new(
            self.name.clone(),
            self.workers().len(),
            self.num_alive_workers(),
            self.idle_workers.lock().len(),
            &self.metrics,
        )
    }

    /// Joins every worker, then drops the sequences still queued. Posting
    /// fails with [`PostTaskError::SchedulerGone`] afterwards.
    pub(crate) fn join_for_testing(&self) -> Result<()> {
        self.joined.store(true, Ordering::Release);

        let panicked = self
            .workers()
            .iter()
            .filter(|entry| entry.worker.join_for_testing().is_err())
            .count();

        // Sequences of sequenced runners hold their runner through their
        // tasks, emptying them releases both.
        let mut dropped = self.shared_priority_queue.begin_transaction().clear();
        for entry in self.workers() {
            dropped.extend(
                entry
                    .state
                    .single_threaded_priority_queue
                    .begin_transaction()
                    .clear(),
            );
        }
        let mut num_tasks_dropped = 0;
        for sequence in dropped {
            for task in sequence.clear() {
                self.task_tracker.drop_task(task);
                num_tasks_dropped += 1;
            }
        }

        debug!(pool = %self.name, num_tasks_dropped, "worker pool joined");

        if panicked > 0 {
            return Err(anyhow!("{} thread(s) panicked in pool {}", panicked, self.name));
        }

        Ok(())
    }
}

impl fmt::Debug for SchedulerWorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerWorkerPool")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("num_workers", &self.workers().len())
            .finish_non_exhaustive()
    }
}

/// State only touched from the worker's own thread.
#[derive(Debug, Default)]
struct DelegateLocal {
    /// Whether the last sequence handed out came from the single-threaded
    /// queue, so it goes back there.
    last_sequence_is_single_threaded: bool,

    /// Set when `get_work` first found nothing to do.
    idle_start_time: Option<Instant>,

    num_tasks_since_last_detach: usize,
}

struct WorkerDelegate {
    pool: Weak<SchedulerWorkerPool>,
    state: Arc<WorkerState>,
    local: Mutex<DelegateLocal>,
}

impl SchedulerWorkerDelegate for WorkerDelegate {
    fn on_main_entry(&self, worker: &SchedulerWorker, detach_duration: Duration) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };

        if detach_duration != Duration::MAX {
            pool.metrics.record_detach_duration(detach_duration);
        }

        context::set_current_pool(Some(pool.id));

        // Nothing was asked of the new thread yet.
        self.local.lock().idle_start_time = None;

        trace!(pool = %pool.name, worker = %worker.id(), index = self.state.index, "worker thread entered");
    }

    fn get_work(&self, worker: &SchedulerWorker) -> Option<Arc<Sequence>> {
        let pool = self.pool.upgrade()?;
        let mut local = self.local.lock();

        let sequence = {
            let mut shared_transaction = pool.shared_priority_queue.begin_transaction();
            let mut single_threaded_transaction = self
                .state
                .single_threaded_priority_queue
                .begin_transaction();

            if shared_transaction.is_empty() && single_threaded_transaction.is_empty() {
                drop(single_threaded_transaction);

                // Still holding the shared transaction: a post racing with us
                // either lands before and is seen here, or after and finds us
                // on the idle stack.
                pool.add_to_idle_workers_stack(self.state.index);
                local.idle_start_time.get_or_insert_with(Instant::now);
                return None;
            }

            let shared_is_more_important = match (
                shared_transaction.peek_sort_key(),
                single_threaded_transaction.peek_sort_key(),
            ) {
                (Some(shared), Some(single_threaded)) => shared > single_threaded,
                (Some(_), None) => true,
                _ => false,
            };

            local.last_sequence_is_single_threaded = !shared_is_more_important;
            if shared_is_more_important {
                shared_transaction.pop_sequence()
            } else {
                single_threaded_transaction.pop_sequence()
            }
        };

        local.idle_start_time = None;
        drop(local);

        pool.remove_from_idle_workers_stack(self.state.index);
        trace!(pool = %pool.name, worker = %worker.id(), "got work");
        sequence
    }

    fn did_run_task_with_priority(&self, priority: TaskPriority, latency: Duration) {
        self.local.lock().num_tasks_since_last_detach += 1;

        if let Some(pool) = self.pool.upgrade() {
            pool.metrics.record_task(priority, latency);
        }
    }

    fn re_enqueue_sequence(&self, sequence: Arc<Sequence>) {
        if self.local.lock().last_sequence_is_single_threaded {
            // Single-threaded sequences never leave their worker.
            let sort_key = sequence.sort_key();
            self.state
                .single_threaded_priority_queue
                .begin_transaction()
                .push(sequence, sort_key);
        } else {
            (self.pool_re_enqueue_callback())(sequence);
        }
    }

    fn get_sleep_timeout(&self) -> Duration {
        self.pool
            .upgrade()
            .map_or(Duration::MAX, |pool| pool.suggested_reclaim_time)
    }

    fn can_detach(&self, _worker: &SchedulerWorker) -> bool {
        let Some(pool) = self.pool.upgrade() else {
            return false;
        };

        // A runner bound after this check simply runs its tasks on the next
        // thread created for this worker.
        let idle_long_enough = self
            .local
            .lock()
            .idle_start_time
            .is_some_and(|since| since.elapsed() > pool.suggested_reclaim_time);

        idle_long_enough
            && pool.peek_at_idle_workers_stack() != Some(self.state.index)
            && self
                .state
                .num_single_threaded_runners
                .load(Ordering::Acquire)
                == 0
            && !pool.worker_detachment_disallowed.load(Ordering::Acquire)
    }

    fn on_detach(&self) {
        let num_tasks = std::mem::take(&mut self.local.lock().num_tasks_since_last_detach);

        if let Some(pool) = self.pool.upgrade() {
            pool.metrics.record_detach();
            debug!(pool = %pool.name, index = self.state.index, num_tasks, "worker detaching");
        }
    }

    fn thread_name(&self, worker: &SchedulerWorker) -> String {
        match self.pool.upgrade() {
            Some(pool) => format!("{}-{}", pool.name, self.state.index),
            None => format!("threadline-{}", worker.id()),
        }
    }
}

impl WorkerDelegate {
    fn pool_re_enqueue_callback(&self) -> ReEnqueueSequenceCallback {
        match self.pool.upgrade() {
            Some(pool) => Arc::clone(&pool.re_enqueue_sequence_callback),
            // The pool is gone, so is every queue the sequence could go to.
            None => Arc::new(|_sequence: Arc<Sequence>| {}),
        }
    }
}
