use crate::context;
use crate::errors::SchedulerError;
use crate::task::WorkerId;
use crate::task_tracker::TaskTracker;
use crate::utils::WaitableEvent;
use crate::utils::thread::{
    ThreadPriority, can_increase_current_thread_priority, set_current_thread_priority,
};
use crate::worker::SchedulerWorkerDelegate;
use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

#[cfg(test)]
thread_local! {
    /// Thread spawns left before `spawn_thread` fails, on the calling thread.
    static SPAWNS_BEFORE_FAILURE: std::cell::Cell<Option<usize>> = const { std::cell::Cell::new(None) };
}

/// Makes the calling thread's `n + 1`th worker thread spawn fail. `None`
/// restores normal spawning.
#[cfg(test)]
pub(crate) fn fail_spawn_after_for_testing(n: Option<usize>) {
    SPAWNS_BEFORE_FAILURE.set(n);
}

/// Whether a worker gets a thread at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InitialState {
    /// A thread is spawned right away and waits for a first wake up.
    Alive,

    /// No thread until the first [`SchedulerWorker::wake_up`].
    Detached,
}

/// A worker that runs tasks from sequences handed out by its delegate, on a
/// thread it can release when idle and recreate on demand.
pub(crate) struct SchedulerWorker {
    id: WorkerId,
    priority_hint: ThreadPriority,
    delegate: Box<dyn SchedulerWorkerDelegate>,
    task_tracker: Arc<TaskTracker>,

    /// Guards thread creation and detachment.
    thread_lock: Mutex<ThreadSlot>,

    should_exit_for_testing: AtomicBool,
}

#[derive(Default)]
struct ThreadSlot {
    thread: Option<WorkerThread>,

    /// `None` until the first detach.
    last_detach_time: Option<Instant>,
}

struct WorkerThread {
    handle: JoinHandle<()>,

    /// Signaled by `wake_up`, owned by exactly one thread generation.
    wake_up_event: Arc<WaitableEvent>,
}

impl SchedulerWorker {
    pub(crate) fn try_new(
        priority_hint: ThreadPriority,
        delegate: Box<dyn SchedulerWorkerDelegate>,
        task_tracker: Arc<TaskTracker>,
        initial_state: InitialState,
    ) -> Result<Arc<SchedulerWorker>> {
        let worker = Arc::new(SchedulerWorker {
            id: WorkerId::next(),
            priority_hint,
            delegate,
            task_tracker,
            thread_lock: Mutex::new(ThreadSlot::default()),
            should_exit_for_testing: AtomicBool::new(false),
        });

        if initial_state == InitialState::Alive {
            let mut slot = worker.thread_lock.lock();
            let thread = worker.spawn_thread(&slot)?;
            slot.thread = Some(thread);
        }

        Ok(worker)
    }

    pub(crate) fn id(&self) -> WorkerId {
        self.id
    }

    /// Makes the worker call `get_work` until it returns `None`. Creates a
    /// thread if the worker is detached. Can be called from any thread.
    pub(crate) fn wake_up(self: &Arc<Self>) {
        let mut slot = self.thread_lock.lock();

        if slot.thread.is_none() {
            if self.should_exit_for_testing.load(Ordering::Acquire) {
                return;
            }

            let spawned = self.spawn_thread(&slot);
            match spawned {
                Ok(thread) => {
                    debug!(worker = %self.id, "re-attached worker thread");
                    slot.thread = Some(thread);
                }
                Err(e) => {
                    // The worker stays detached, the next wake up retries.
                    error!(worker = %self.id, error = %e, "failed to re-attach worker thread");
                    return;
                }
            }
        }

        if let Some(thread) = &slot.thread {
            thread.wake_up_event.signal();
        }
    }

    /// Makes the thread exit at its next loop iteration and joins it. The
    /// worker never gets a thread again.
    pub(crate) fn join_for_testing(self: &Arc<Self>) -> Result<()> {
        self.should_exit_for_testing.store(true, Ordering::Release);
        self.wake_up();

        // Joining outside of the lock lets the exiting thread attempt a
        // detach without deadlocking.
        let thread = self.thread_lock.lock().thread.take();

        if let Some(thread) = thread {
            thread
                .handle
                .join()
                .map_err(|_| anyhow!("worker {} thread panicked", self.id))?;
        }

        Ok(())
    }

    pub(crate) fn thread_alive_for_testing(&self) -> bool {
        self.thread_lock.lock().thread.is_some()
    }

    // Must be called with `thread_lock` held, hence the `slot` witness.
    fn spawn_thread(self: &Arc<Self>, slot: &ThreadSlot) -> Result<WorkerThread, SchedulerError> {
        let detach_duration = slot
            .last_detach_time
            .map_or(Duration::MAX, |at| at.elapsed());

        let name = self.delegate.thread_name(self);
        let wake_up_event = Arc::new(WaitableEvent::new());

        #[cfg(test)]
        if let Some(left) = SPAWNS_BEFORE_FAILURE.get() {
            if left == 0 {
                return Err(SchedulerError::WorkerSpawn {
                    name,
                    source: std::io::Error::other("spawn disabled for testing"),
                });
            }
            SPAWNS_BEFORE_FAILURE.set(Some(left - 1));
        }

        let outer = Arc::clone(self);
        let event = Arc::clone(&wake_up_event);

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || outer.run(event, detach_duration))
            .map_err(|source| SchedulerError::WorkerSpawn {
                name: name.clone(),
                source,
            })?;

        trace!(worker = %self.id, thread = %name, "spawned worker thread");

        Ok(WorkerThread {
            handle,
            wake_up_event,
        })
    }

    /// Releases the thread unless a wake up is pending.
    fn detach(&self) -> Option<WorkerThread> {
        let mut slot = self.thread_lock.lock();

        // A wake up that raced with the decision to detach must be followed by
        // a call to `get_work`.
        if slot
            .thread
            .as_ref()
            .is_none_or(|thread| thread.wake_up_event.is_signaled())
        {
            return None;
        }

        self.delegate.on_detach();
        slot.last_detach_time = Some(Instant::now());
        slot.thread.take()
    }

    fn should_exit(&self) -> bool {
        self.task_tracker.is_shutdown_complete()
            || self.should_exit_for_testing.load(Ordering::Acquire)
    }

    pub(super) fn desired_thread_priority(&self) -> ThreadPriority {
        // Background threads go back to NORMAL once shutdown started so they
        // cannot hold it up. If that bump would be refused, never go below
        // NORMAL in the first place.
        if self.priority_hint < ThreadPriority::Normal
            && (self.task_tracker.has_shutdown_started() || !can_increase_current_thread_priority())
        {
            return ThreadPriority::Normal;
        }

        self.priority_hint
    }

    fn run(self: Arc<Self>, wake_up_event: Arc<WaitableEvent>, detach_duration: Duration) {
        context::set_current_worker(Some(self.id));

        // Threads inherit the priority of whichever thread spawned them.
        let mut current_priority = self.desired_thread_priority();
        self.apply_thread_priority(current_priority);

        self.delegate.on_main_entry(&self, detach_duration);

        // A new thread starts out waiting for work.
        self.wait_for_work(&wake_up_event);

        while !self.should_exit() {
            let desired = self.desired_thread_priority();
            if desired != current_priority {
                self.apply_thread_priority(desired);
                current_priority = desired;
            }

            let Some(sequence) = self.delegate.get_work(&self) else {
                if self.delegate.can_detach(&self)
                    && let Some(thread) = self.detach()
                {
                    debug!(worker = %self.id, "detached worker thread");

                    // Dropping our own handle detaches the OS thread.
                    drop(thread);
                    break;
                }

                self.wait_for_work(&wake_up_event);
                continue;
            };

            let Some(task) = sequence.take_task() else {
                warn!(worker = %self.id, sequence = %sequence.token(), "scheduled sequence had no task");
                continue;
            };

            let priority = task.traits.priority();
            let latency = task.sequenced_time.elapsed();

            if self.task_tracker.run_task(task, &sequence) {
                self.delegate.did_run_task_with_priority(priority, latency);
            }

            // A non-empty sequence must always be referenced by a priority
            // queue or a worker.
            if !sequence.pop() {
                self.delegate.re_enqueue_sequence(sequence);
            }

            // Any wake up received while awake is covered by the next call to
            // `get_work`.
            wake_up_event.reset();
        }

        context::set_current_worker(None);
        trace!(worker = %self.id, "worker thread exiting");
    }

    fn wait_for_work(&self, wake_up_event: &WaitableEvent) {
        wake_up_event.timed_wait(self.delegate.get_sleep_timeout());
        wake_up_event.reset();
    }

    fn apply_thread_priority(&self, priority: ThreadPriority) {
        if let Err(e) = set_current_thread_priority(priority) {
            warn!(worker = %self.id, ?priority, error = %e, "failed to set thread priority");
        }
    }
}

impl fmt::Debug for SchedulerWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerWorker")
            .field("id", &self.id)
            .field("priority_hint", &self.priority_hint)
            .finish_non_exhaustive()
    }
}
