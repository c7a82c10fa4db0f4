use crate::context::{self, TaskContextGuard};
use crate::sequence::Sequence;
use crate::task::{Task, TaskShutdownBehavior};
use crate::utils::{ScopeGuard, WaitableEvent};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, trace, warn};

const SHUTDOWN_HAS_STARTED_MASK: usize = 1;
const NUM_TASKS_BLOCKING_SHUTDOWN_SHIFT: u32 = 1;
const NUM_TASKS_BLOCKING_SHUTDOWN_INCREMENT: usize = 1 << NUM_TASKS_BLOCKING_SHUTDOWN_SHIFT;

/// Once this many BLOCK_SHUTDOWN tasks were posted during shutdown, we warn
/// that shutdown may never complete.
const MAX_BLOCK_SHUTDOWN_TASKS_POSTED_DURING_SHUTDOWN: usize = 1000;

/// Packs "shutdown has started" in the lowest bit and the number of tasks
/// blocking shutdown in the remaining bits, so both can be read and updated
/// with a single atomic operation.
#[derive(Debug, Default)]
struct State {
    bits: AtomicUsize,
}

impl State {
    /// Sets the shutdown bit. Returns true if tasks are blocking shutdown.
    fn start_shutdown(&self) -> bool {
        let prev = self.bits.fetch_or(SHUTDOWN_HAS_STARTED_MASK, Ordering::AcqRel);
        (prev >> NUM_TASKS_BLOCKING_SHUTDOWN_SHIFT) != 0
    }

    fn has_shutdown_started(&self) -> bool {
        self.bits.load(Ordering::Acquire) & SHUTDOWN_HAS_STARTED_MASK != 0
    }

    fn are_tasks_blocking_shutdown(&self) -> bool {
        (self.bits.load(Ordering::Acquire) >> NUM_TASKS_BLOCKING_SHUTDOWN_SHIFT) != 0
    }

    /// Returns true if shutdown has started.
    fn increment_num_tasks_blocking_shutdown(&self) -> bool {
        let prev = self
            .bits
            .fetch_add(NUM_TASKS_BLOCKING_SHUTDOWN_INCREMENT, Ordering::AcqRel);
        prev & SHUTDOWN_HAS_STARTED_MASK != 0
    }

    /// Returns true if shutdown has started and no task blocks it anymore.
    fn decrement_num_tasks_blocking_shutdown(&self) -> bool {
        let prev = self
            .bits
            .fetch_sub(NUM_TASKS_BLOCKING_SHUTDOWN_INCREMENT, Ordering::AcqRel);
        debug_assert!(prev >> NUM_TASKS_BLOCKING_SHUTDOWN_SHIFT > 0);

        let new = prev - NUM_TASKS_BLOCKING_SHUTDOWN_INCREMENT;
        new & SHUTDOWN_HAS_STARTED_MASK != 0 && (new >> NUM_TASKS_BLOCKING_SHUTDOWN_SHIFT) == 0
    }
}

#[derive(Debug, Default)]
struct ShutdownState {
    /// Created when shutdown starts, signaled when it completes.
    event: Option<Arc<WaitableEvent>>,

    num_block_shutdown_tasks_posted_during_shutdown: usize,
}

/// Admission control and shutdown coordination, shared by every pool of a
/// scheduler.
#[derive(Debug, Default)]
pub(crate) struct TaskTracker {
    state: State,

    shutdown: Mutex<ShutdownState>,

    /// Undelayed tasks admitted but not yet run or skipped.
    num_pending_undelayed_tasks: AtomicUsize,
    flush_lock: Mutex<()>,
    flush_cv: Condvar,

    num_tasks_skipped: AtomicUsize,
}

impl TaskTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Must be called before `task` is linked into a sequence. A task
    /// refused here must never be run.
    pub(crate) fn will_post_task(&self, task: &Task) -> bool {
        if !self.before_post_task(task.traits.shutdown_behavior()) {
            debug!(
                posted_from = %task.posted_from,
                behavior = ?task.traits.shutdown_behavior(),
                "task rejected"
            );
            return false;
        }

        if !task.is_delayed() {
            self.num_pending_undelayed_tasks
                .fetch_add(1, Ordering::AcqRel);
        }

        true
    }

    /// Runs `task` unless shutdown forbids it. Returns true if the closure
    /// ran.
    ///
    /// If the closure panics, the bookkeeping is still released before the
    /// panic resumes.
    pub(crate) fn run_task(&self, task: Task, sequence: &Sequence) -> bool {
        let behavior = task.traits.shutdown_behavior();
        let is_delayed = task.is_delayed();

        let _pending = ScopeGuard::new(|| {
            if !is_delayed {
                self.decrement_num_pending_undelayed_tasks();
            }
        });

        if !self.before_run_task(behavior) {
            self.num_tasks_skipped.fetch_add(1, Ordering::Relaxed);
            trace!(posted_from = %task.posted_from, ?behavior, "task skipped");
            return false;
        }

        let _after_run = ScopeGuard::new(|| self.after_run_task(behavior));
        let _context = TaskContextGuard::enter(sequence.token(), task.runner);

        trace!(posted_from = %task.posted_from, sequence = %sequence.token(), "running task");
        (task.closure)();

        true
    }

    /// Accounts for an admitted `task` that is dropped without ever reaching
    /// [`TaskTracker::run_task`]. It counts as skipped.
    pub(crate) fn drop_task(&self, task: Task) {
        let behavior = task.traits.shutdown_behavior();

        self.num_tasks_skipped.fetch_add(1, Ordering::Relaxed);
        if !task.is_delayed() {
            self.decrement_num_pending_undelayed_tasks();
        }

        // Counted as blocking since it was posted.
        if behavior == TaskShutdownBehavior::BlockShutdown
            && self.state.decrement_num_tasks_blocking_shutdown()
        {
            self.on_blocking_shutdown_tasks_complete();
        }

        trace!(posted_from = %task.posted_from, ?behavior, "task dropped");
    }

    /// Starts shutdown and blocks until every task blocking shutdown has
    /// completed. Later callers wait for the same completion.
    pub(crate) fn shutdown(&self) {
        debug_assert!(
            context::current_worker().is_none(),
            "shutdown() called from a scheduler worker thread"
        );

        let event = {
            let mut shutdown = self.shutdown.lock();

            if let Some(event) = &shutdown.event {
                let event = Arc::clone(event);
                if !self.state.are_tasks_blocking_shutdown() {
                    event.signal();
                }
                drop(shutdown);
                event.wait();
                return;
            }

            let event = Arc::new(WaitableEvent::new());
            shutdown.event = Some(Arc::clone(&event));

            debug!("shutdown started");
            if !self.state.start_shutdown() {
                // A BLOCK_SHUTDOWN post racing with us waits on the shutdown
                // lock, then sees a signaled event and is refused.
                event.signal();
                drop(shutdown);
                self.on_shutdown_complete();
                return;
            }

            event
        };

        event.wait();
        self.on_shutdown_complete();
    }

    fn on_shutdown_complete(&self) {
        let posted = self
            .shutdown
            .lock()
            .num_block_shutdown_tasks_posted_during_shutdown;
        debug!(
            block_shutdown_tasks_posted_during_shutdown = posted,
            "shutdown complete"
        );

        // Unblock flush().
        let _guard = self.flush_lock.lock();
        self.flush_cv.notify_all();
    }

    /// Waits until every admitted undelayed task has run or been skipped, or
    /// until shutdown completes.
    pub(crate) fn flush(&self) {
        let mut guard = self.flush_lock.lock();
        while self.num_pending_undelayed_tasks.load(Ordering::Acquire) != 0
            && !self.is_shutdown_complete()
        {
            self.flush_cv.wait(&mut guard);
        }
    }

    pub(crate) fn has_shutdown_started(&self) -> bool {
        self.state.has_shutdown_started()
    }

    pub(crate) fn is_shutdown_complete(&self) -> bool {
        self.shutdown
            .lock()
            .event
            .as_ref()
            .is_some_and(|event| event.is_signaled())
    }

    /// Marks shutdown as started without waiting for anything.
    #[cfg(test)]
    pub(crate) fn set_has_shutdown_started_for_testing(&self) {
        let mut shutdown = self.shutdown.lock();
        if shutdown.event.is_none() {
            shutdown.event = Some(Arc::new(WaitableEvent::new()));
        }
        self.state.start_shutdown();
    }

    pub(crate) fn num_tasks_skipped(&self) -> usize {
        self.num_tasks_skipped.load(Ordering::Relaxed)
    }

    pub(crate) fn num_block_shutdown_tasks_posted_during_shutdown(&self) -> usize {
        self.shutdown
            .lock()
            .num_block_shutdown_tasks_posted_during_shutdown
    }

    #[cfg(test)]
    pub(crate) fn num_pending_undelayed_tasks(&self) -> usize {
        self.num_pending_undelayed_tasks.load(Ordering::Acquire)
    }

    fn before_post_task(&self, behavior: TaskShutdownBehavior) -> bool {
        if behavior != TaskShutdownBehavior::BlockShutdown {
            return !self.state.has_shutdown_started();
        }

        // BLOCK_SHUTDOWN tasks block shutdown from post until completion.
        if !self.state.increment_num_tasks_blocking_shutdown() {
            return true;
        }

        let mut shutdown = self.shutdown.lock();
        let completed = shutdown
            .event
            .as_ref()
            .is_none_or(|event| event.is_signaled());

        if completed {
            self.state.decrement_num_tasks_blocking_shutdown();
            return false;
        }

        shutdown.num_block_shutdown_tasks_posted_during_shutdown += 1;
        if shutdown.num_block_shutdown_tasks_posted_during_shutdown
            == MAX_BLOCK_SHUTDOWN_TASKS_POSTED_DURING_SHUTDOWN
        {
            warn!(
                limit = MAX_BLOCK_SHUTDOWN_TASKS_POSTED_DURING_SHUTDOWN,
                "many BLOCK_SHUTDOWN tasks posted during shutdown, it may never complete"
            );
        }

        true
    }

    fn before_run_task(&self, behavior: TaskShutdownBehavior) -> bool {
        match behavior {
            TaskShutdownBehavior::BlockShutdown => {
                // Counted as blocking since it was posted.
                debug_assert!(self.state.are_tasks_blocking_shutdown());
                true
            }
            TaskShutdownBehavior::SkipOnShutdown => {
                // Blocks shutdown while it runs.
                if !self.state.increment_num_tasks_blocking_shutdown() {
                    return true;
                }

                if self.state.decrement_num_tasks_blocking_shutdown() {
                    self.on_blocking_shutdown_tasks_complete();
                }
                false
            }
            TaskShutdownBehavior::ContinueOnShutdown => !self.state.has_shutdown_started(),
        }
    }

    fn after_run_task(&self, behavior: TaskShutdownBehavior) {
        if matches!(
            behavior,
            TaskShutdownBehavior::BlockShutdown | TaskShutdownBehavior::SkipOnShutdown
        ) && self.state.decrement_num_tasks_blocking_shutdown()
        {
            self.on_blocking_shutdown_tasks_complete();
        }
    }

    fn on_blocking_shutdown_tasks_complete(&self) {
        let shutdown = self.shutdown.lock();
        debug_assert!(self.state.has_shutdown_started());

        if let Some(event) = &shutdown.event {
            event.signal();
        }
    }

    fn decrement_num_pending_undelayed_tasks(&self) {
        let prev = self
            .num_pending_undelayed_tasks
            .fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);

        if prev == 1 {
            let _guard = self.flush_lock.lock();
            self.flush_cv.notify_all();
        }
    }
}
