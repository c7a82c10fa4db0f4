use crate::delayed::DelayedTaskManager;
use crate::errors::PostTaskError;
use crate::pool::{
    PoolStats, ReEnqueueSequenceCallback, SchedulerWorkerPool, TaskRunner,
};
use crate::scheduler::builder::{SchedulerConfig, WorkerPoolIndexForTraitsFn};
use crate::sequence::Sequence;
use crate::task::{Closure, ExecutionMode, Location, Task, TaskTraits};
use crate::task_tracker::TaskTracker;
use anyhow::{Result, anyhow};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tracing::{debug, error, trace};

/// Runs posted tasks on worker pools selected by their traits.
///
/// Built with [`crate::Builder`]. Dropping the scheduler shuts it down, which
/// blocks until every `BlockShutdown` task has completed, then joins every
/// thread it created.
pub struct TaskScheduler {
    task_tracker: Arc<TaskTracker>,
    delayed_task_manager: Arc<DelayedTaskManager>,
    worker_pools: Arc<PoolSet>,
    joined: AtomicBool,
}

/// The pools plus the mapping used to pick one. Re-enqueued sequences only
/// reach it through a `Weak`, so worker threads never keep it alive.
struct PoolSet {
    pools: Vec<Arc<SchedulerWorkerPool>>,
    index_for_traits: WorkerPoolIndexForTraitsFn,
}

impl PoolSet {
    fn pool_for_traits(&self, traits: &TaskTraits) -> &Arc<SchedulerWorkerPool> {
        let index = (self.index_for_traits.0)(traits);
        debug_assert!(
            index < self.pools.len(),
            "pool index {index} out of range for {traits:?}"
        );

        // The config guarantees at least one pool.
        &self.pools[index.min(self.pools.len() - 1)]
    }

    fn re_enqueue_sequence(&self, sequence: Arc<Sequence>) {
        let sort_key = sequence.sort_key();

        // The pool is picked by the most important queued task, which may
        // move the sequence to another pool.
        let traits = sequence
            .peek_task_traits()
            .unwrap_or_default()
            .with_priority(sort_key.priority());

        self.pool_for_traits(&traits)
            .re_enqueue_sequence(sequence, sort_key);
    }
}

impl TaskScheduler {
    pub(crate) fn try_new(cfg: SchedulerConfig) -> Result<TaskScheduler> {
        let task_tracker = Arc::new(TaskTracker::new());
        let delayed_task_manager = Arc::new(DelayedTaskManager::try_new(
            cfg.service_thread_name.clone(),
            Arc::clone(&task_tracker),
        )?);

        let pool_set: Arc<OnceLock<Weak<PoolSet>>> = Arc::new(OnceLock::new());
        let re_enqueue_sequence_callback: ReEnqueueSequenceCallback = {
            let pool_set = Arc::clone(&pool_set);
            Arc::new(move |sequence: Arc<Sequence>| match pool_set.get().and_then(Weak::upgrade) {
                Some(pools) => pools.re_enqueue_sequence(sequence),
                None => trace!(sequence = %sequence.token(), "scheduler gone, sequence dropped"),
            })
        };

        let mut pools = Vec::with_capacity(cfg.worker_pools.len());
        for params in &cfg.worker_pools {
            match SchedulerWorkerPool::try_new(
                params,
                Arc::clone(&re_enqueue_sequence_callback),
                Arc::clone(&task_tracker),
                Arc::clone(&delayed_task_manager),
            ) {
                Ok(pool) => pools.push(pool),
                Err(e) => {
                    for pool in &pools {
                        if let Err(e) = pool.join_for_testing() {
                            error!(pool = %pool.name(), error = %e, "failed to join worker pool after bring-up failure");
                        }
                    }
                    delayed_task_manager.stop();
                    return Err(e);
                }
            }
        }

        let worker_pools = Arc::new(PoolSet {
            pools,
            index_for_traits: cfg.worker_pool_index_for_traits,
        });
        pool_set
            .set(Arc::downgrade(&worker_pools))
            .map_err(|_| anyhow!("task scheduler initialized twice"))?;

        debug!(
            num_pools = worker_pools.pools.len(),
            service_thread = %cfg.service_thread_name,
            "task scheduler started"
        );

        Ok(TaskScheduler {
            task_tracker,
            delayed_task_manager,
            worker_pools,
            joined: AtomicBool::new(false),
        })
    }

    /// Posts `f` to run on a pool chosen from `traits`, with no ordering
    /// relative to any other task.
    #[track_caller]
    pub fn post_task_with_traits<F>(&self, traits: TaskTraits, f: F) -> Result<(), PostTaskError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_task_from(std::panic::Location::caller(), traits, Box::new(f), Duration::ZERO)
    }

    /// Like [`TaskScheduler::post_task_with_traits`], but `f` is not queued
    /// before `delay` expired. A delayed `BlockShutdown` task is treated as
    /// `SkipOnShutdown`.
    #[track_caller]
    pub fn post_delayed_task_with_traits<F>(
        &self,
        traits: TaskTraits,
        f: F,
        delay: Duration,
    ) -> Result<(), PostTaskError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_task_from(std::panic::Location::caller(), traits, Box::new(f), delay)
    }

    fn post_task_from(
        &self,
        posted_from: Location,
        traits: TaskTraits,
        closure: Closure,
        delay: Duration,
    ) -> Result<(), PostTaskError> {
        let task = Task::new(posted_from, closure, traits, delay);

        self.worker_pools
            .pool_for_traits(&traits)
            .post_task_with_sequence(task, Arc::new(Sequence::new()), None)
    }

    /// Returns a runner posting tasks with `traits` on the matching pool,
    /// ordered according to `mode`.
    pub fn create_task_runner_with_traits(
        &self,
        traits: TaskTraits,
        mode: ExecutionMode,
    ) -> Arc<dyn TaskRunner> {
        self.worker_pools
            .pool_for_traits(&traits)
            .create_task_runner_with_traits(traits, mode)
    }

    /// Refuses new non-blocking tasks, then waits for every `BlockShutdown`
    /// task to complete. Queued `SkipOnShutdown` and `ContinueOnShutdown`
    /// tasks never run. Idempotent, and must not be called from a task.
    pub fn shutdown(&self) {
        self.task_tracker.shutdown();
    }

    /// Waits until every undelayed task posted so far has run or was
    /// skipped. Returns early if shutdown completes.
    pub fn flush_for_testing(&self) {
        self.task_tracker.flush();
    }

    /// Joins every thread of the scheduler. Queued tasks are dropped and any
    /// later post fails with [`PostTaskError::SchedulerGone`].
    pub fn join_for_testing(&self) -> Result<()> {
        if self.joined.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // Delayed tasks could otherwise be forwarded to a joined pool.
        self.delayed_task_manager.stop();

        let failed = self
            .worker_pools
            .pools
            .iter()
            .filter_map(|pool| pool.join_for_testing().err())
            .inspect(|e| error!(error = %e, "failed to join worker pool"))
            .count();

        if failed > 0 {
            return Err(anyhow!("{} worker pool(s) failed to join", failed));
        }

        debug!("task scheduler joined");
        Ok(())
    }

    #[cfg(test)]
    pub(super) fn pool_for_testing(&self, index: usize) -> Option<&Arc<SchedulerWorkerPool>> {
        self.worker_pools.pools.get(index)
    }

    /// One snapshot per pool, in pool index order.
    pub fn stats(&self) -> Vec<PoolStats> {
        self.worker_pools
            .pools
            .iter()
            .map(|pool| pool.stats())
            .collect()
    }

    /// Number of tasks refused to run because shutdown had started.
    pub fn num_tasks_skipped(&self) -> usize {
        self.task_tracker.num_tasks_skipped()
    }

    /// Number of `BlockShutdown` tasks admitted after shutdown started.
    pub fn num_block_shutdown_tasks_posted_during_shutdown(&self) -> usize {
        self.task_tracker
            .num_block_shutdown_tasks_posted_during_shutdown()
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        if self.joined.load(Ordering::Acquire) {
            return;
        }

        self.shutdown();
        if let Err(e) = self.join_for_testing() {
            error!(error = %e, "error during task scheduler teardown");
        }
    }
}

impl fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self
            .worker_pools
            .pools
            .iter()
            .map(|pool| pool.name())
            .collect();

        f.debug_struct("TaskScheduler")
            .field("worker_pools", &names)
            .field("shutdown_started", &self.task_tracker.has_shutdown_started())
            .finish_non_exhaustive()
    }
}
