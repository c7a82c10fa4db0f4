use crate::errors::SchedulerError;
use crate::sequence::Sequence;
use crate::task::{SequenceToken, Task, TaskPriority, TaskTraits};
use crate::task_tracker::TaskTracker;
use crate::test_utils::*;
use crate::utils::WaitableEvent;
use crate::utils::thread::{
    ThreadPriority, can_increase_current_thread_priority, current_thread_priority,
};
use crate::worker::{
    InitialState, SchedulerWorker, SchedulerWorkerDelegate, fail_spawn_after_for_testing,
};
use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

assert_impl_all!(SchedulerWorker: Send, Sync);

const NUM_SEQUENCES_PER_TEST: usize = 150;

// Hands out sequences of `num_tasks_per_sequence` tasks while
// `num_sequences_to_create` is positive.
struct SupplyState {
    tracker: Tracker,
    task_tracker: Arc<TaskTracker>,
    num_tasks_per_sequence: usize,
    num_sequences_to_create: AtomicUsize,
    num_run_tasks: Arc<AtomicUsize>,
    created: Mutex<Vec<SequenceToken>>,
    re_enqueued: Mutex<Vec<SequenceToken>>,
}

impl SupplyState {
    fn new(num_tasks_per_sequence: usize) -> Arc<Self> {
        Arc::new(Self {
            tracker: Tracker::new(),
            task_tracker: Arc::new(TaskTracker::new()),
            num_tasks_per_sequence,
            num_sequences_to_create: AtomicUsize::new(0),
            num_run_tasks: Arc::new(AtomicUsize::new(0)),
            created: Mutex::new(Vec::new()),
            re_enqueued: Mutex::new(Vec::new()),
        })
    }
}

struct SupplyDelegate(Arc<SupplyState>);

impl SchedulerWorkerDelegate for SupplyDelegate {
    fn on_main_entry(&self, _worker: &SchedulerWorker, detach_duration: Duration) {
        self.0.tracker.record(
            Method::OnMainEntry,
            Call::OnMainEntry {
                detach_duration,
                priority: current_thread_priority(),
            },
        );
    }

    fn get_work(&self, _worker: &SchedulerWorker) -> Option<Arc<Sequence>> {
        let state = &self.0;

        let claimed = state
            .num_sequences_to_create
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();

        state.tracker.record(
            Method::GetWork,
            Call::GetWork {
                returned_work: claimed,
                priority: current_thread_priority(),
            },
        );

        if !claimed {
            return None;
        }

        let sequence = Arc::new(Sequence::new());
        for _ in 0..state.num_tasks_per_sequence {
            let task = counting_task(TaskTraits::new(), &state.num_run_tasks);
            assert!(state.task_tracker.will_post_task(&task));
            sequence.push_task(task);
        }

        state.created.lock().push(sequence.token());
        Some(sequence)
    }

    fn did_run_task_with_priority(&self, priority: TaskPriority, _latency: Duration) {
        self.0
            .tracker
            .record(Method::DidRunTask, Call::DidRunTask { priority });
    }

    fn re_enqueue_sequence(&self, sequence: Arc<Sequence>) {
        self.0.tracker.record(
            Method::ReEnqueueSequence,
            Call::ReEnqueueSequence {
                token: sequence.token(),
                num_tasks: sequence.len(),
            },
        );
        self.0.re_enqueued.lock().push(sequence.token());
    }

    fn get_sleep_timeout(&self) -> Duration {
        Duration::MAX
    }

    fn can_detach(&self, _worker: &SchedulerWorker) -> bool {
        false
    }
}

fn new_supply_worker(state: &Arc<SupplyState>) -> Result<Arc<SchedulerWorker>> {
    SchedulerWorker::try_new(
        ThreadPriority::Normal,
        Box::new(SupplyDelegate(Arc::clone(state))),
        Arc::clone(&state.task_tracker),
        InitialState::Alive,
    )
}

fn check_re_enqueued(state: &SupplyState) {
    let re_enqueue_calls = state.tracker.get_calls(&Method::ReEnqueueSequence);

    if state.num_tasks_per_sequence == 1 {
        assert!(re_enqueue_calls.is_empty());
        return;
    }

    // Every sequence comes back exactly once, minus the task that ran.
    for call in &re_enqueue_calls {
        let Call::ReEnqueueSequence { num_tasks, .. } = call else {
            unreachable!("only ReEnqueueSequence calls are recorded under this method");
        };
        assert_eq!(*num_tasks, state.num_tasks_per_sequence - 1);
    }

    let created = state.created.lock().iter().copied().collect::<HashSet<_>>();
    let re_enqueued = state.re_enqueued.lock().iter().copied().collect::<HashSet<_>>();
    assert_eq!(re_enqueue_calls.len(), created.len());
    assert_eq!(created, re_enqueued);
}

#[rstest]
#[case::one_task_per_sequence(1)]
#[case::two_tasks_per_sequence(2)]
fn test_continuous_work(#[case] num_tasks_per_sequence: usize) -> Result<()> {
    init_tracing();
    let state = SupplyState::new(num_tasks_per_sequence);
    let worker = new_supply_worker(&state)?;

    state
        .num_sequences_to_create
        .store(NUM_SEQUENCES_PER_TEST, Ordering::Release);
    worker.wake_up();

    // One extra call returns no work.
    state
        .tracker
        .wait_for_calls(Method::GetWork, NUM_SEQUENCES_PER_TEST + 1)?;

    assert_eq!(state.num_run_tasks.load(Ordering::SeqCst), NUM_SEQUENCES_PER_TEST);
    assert_eq!(
        state.tracker.num_calls(&Method::DidRunTask),
        NUM_SEQUENCES_PER_TEST
    );
    assert_eq!(state.created.lock().len(), NUM_SEQUENCES_PER_TEST);
    check_re_enqueued(&state);

    worker.join_for_testing()
}

#[rstest]
#[case::one_task_per_sequence(1)]
#[case::two_tasks_per_sequence(2)]
fn test_intermittent_work(#[case] num_tasks_per_sequence: usize) -> Result<()> {
    init_tracing();
    let state = SupplyState::new(num_tasks_per_sequence);
    let worker = new_supply_worker(&state)?;

    for i in 0..NUM_SEQUENCES_PER_TEST {
        state.num_sequences_to_create.store(1, Ordering::Release);
        worker.wake_up();

        // One call with work, one without.
        state.tracker.wait_for_calls(Method::GetWork, 2 * (i + 1))?;
    }

    assert_eq!(state.num_run_tasks.load(Ordering::SeqCst), NUM_SEQUENCES_PER_TEST);
    check_re_enqueued(&state);

    // A single thread did all the work.
    assert_eq!(state.tracker.num_calls(&Method::OnMainEntry), 1);

    worker.join_for_testing()
}

// Hands out a single task, then no work. Detachment is controlled by the test.
struct DetachState {
    tracker: Tracker,
    task_tracker: Arc<TaskTracker>,
    work_requested: AtomicBool,
    work_processed: Arc<WaitableEvent>,
    detach_requested: WaitableEvent,
    can_detach: AtomicBool,
}

impl DetachState {
    fn new(can_detach: bool) -> Arc<Self> {
        Arc::new(Self {
            tracker: Tracker::new(),
            task_tracker: Arc::new(TaskTracker::new()),
            work_requested: AtomicBool::new(false),
            work_processed: Arc::new(WaitableEvent::new()),
            detach_requested: WaitableEvent::new(),
            can_detach: AtomicBool::new(can_detach),
        })
    }

    fn reset(&self) {
        self.work_requested.store(false, Ordering::Release);
        self.work_processed.reset();
        self.detach_requested.reset();
    }

    fn wait_for_work_to_run(&self) -> Result<()> {
        self.work_processed
            .timed_wait(TEST_TIMEOUT)
            .then_some(())
            .ok_or_else(|| anyhow!("work never ran"))
    }

    fn wait_for_detach_request(&self) -> Result<()> {
        self.detach_requested
            .timed_wait(TEST_TIMEOUT)
            .then_some(())
            .ok_or_else(|| anyhow!("can_detach never called"))
    }

    fn detach_durations(&self) -> Vec<Duration> {
        self.tracker
            .get_calls(&Method::OnMainEntry)
            .into_iter()
            .filter_map(|call| match call {
                Call::OnMainEntry {
                    detach_duration, ..
                } => Some(detach_duration),
                _ => None,
            })
            .collect()
    }
}

struct DetachDelegate(Arc<DetachState>);

impl SchedulerWorkerDelegate for DetachDelegate {
    fn on_main_entry(&self, _worker: &SchedulerWorker, detach_duration: Duration) {
        self.0.tracker.record(
            Method::OnMainEntry,
            Call::OnMainEntry {
                detach_duration,
                priority: current_thread_priority(),
            },
        );
    }

    fn get_work(&self, _worker: &SchedulerWorker) -> Option<Arc<Sequence>> {
        if self.0.work_requested.swap(true, Ordering::AcqRel) {
            return None;
        }

        let processed = Arc::clone(&self.0.work_processed);
        let task = Task::new(
            std::panic::Location::caller(),
            Box::new(move || processed.signal()),
            TaskTraits::new(),
            Duration::ZERO,
        );
        assert!(self.0.task_tracker.will_post_task(&task));

        let sequence = Arc::new(Sequence::new());
        sequence.push_task(task);
        Some(sequence)
    }

    fn did_run_task_with_priority(&self, _priority: TaskPriority, _latency: Duration) {}

    fn re_enqueue_sequence(&self, _sequence: Arc<Sequence>) {
        unreachable!("single task sequences are never re-enqueued");
    }

    fn get_sleep_timeout(&self) -> Duration {
        Duration::MAX
    }

    fn can_detach(&self, _worker: &SchedulerWorker) -> bool {
        let allowed = self.0.can_detach.load(Ordering::Acquire);
        self.0
            .tracker
            .record(Method::CanDetach, Call::CanDetach { allowed });
        self.0.detach_requested.signal();
        allowed
    }

    fn on_detach(&self) {
        self.0.tracker.record(Method::OnDetach, Call::OnDetach);
    }
}

fn new_detach_worker(
    state: &Arc<DetachState>,
    initial_state: InitialState,
) -> Result<Arc<SchedulerWorker>> {
    SchedulerWorker::try_new(
        ThreadPriority::Normal,
        Box::new(DetachDelegate(Arc::clone(state))),
        Arc::clone(&state.task_tracker),
        initial_state,
    )
}

#[test]
fn test_worker_detaches() -> Result<()> {
    init_tracing();
    let state = DetachState::new(true);
    let worker = new_detach_worker(&state, InitialState::Alive)?;
    assert!(worker.thread_alive_for_testing());

    worker.wake_up();
    state.wait_for_work_to_run()?;
    state.wait_for_detach_request()?;

    wait_until(|| !worker.thread_alive_for_testing())?;
    assert_eq!(state.detach_durations(), vec![Duration::MAX]);
    assert_eq!(state.tracker.num_calls(&Method::OnDetach), 1);
    Ok(())
}

#[test]
fn test_worker_detaches_and_wakes() -> Result<()> {
    init_tracing();
    let state = DetachState::new(true);
    let worker = new_detach_worker(&state, InitialState::Alive)?;

    worker.wake_up();
    state.wait_for_work_to_run()?;
    state.wait_for_detach_request()?;
    wait_until(|| !worker.thread_alive_for_testing())?;

    // Wake up the detached worker, this time it has to stay alive.
    state.reset();
    state.can_detach.store(false, Ordering::Release);

    worker.wake_up();
    state.wait_for_work_to_run()?;
    state.wait_for_detach_request()?;

    thread::sleep(Duration::from_millis(50));
    assert!(worker.thread_alive_for_testing());

    // The recreated thread knows how long the worker was detached.
    let durations = state.detach_durations();
    assert_eq!(durations.len(), 2);
    assert_eq!(durations[0], Duration::MAX);
    assert_ne!(durations[1], Duration::MAX);

    worker.join_for_testing()?;
    assert!(!worker.thread_alive_for_testing());
    Ok(())
}

#[test]
fn test_create_detached() -> Result<()> {
    init_tracing();
    let state = DetachState::new(false);
    let worker = new_detach_worker(&state, InitialState::Detached)?;
    assert!(!worker.thread_alive_for_testing());

    worker.wake_up();
    state.wait_for_work_to_run()?;
    state.wait_for_detach_request()?;

    assert!(worker.thread_alive_for_testing());
    assert_eq!(state.detach_durations(), vec![Duration::MAX]);

    worker.join_for_testing()
}

#[test]
fn test_join_detached_worker_spawns_nothing() -> Result<()> {
    let state = DetachState::new(false);
    let worker = new_detach_worker(&state, InitialState::Detached)?;

    worker.join_for_testing()?;
    worker.wake_up();

    assert!(!worker.thread_alive_for_testing());
    assert_eq!(state.tracker.num_calls(&Method::OnMainEntry), 0);
    assert!(!state.work_requested.load(Ordering::Acquire));
    Ok(())
}

#[test]
fn test_worker_thread_is_named_by_delegate() -> Result<()> {
    struct NamedDelegate(Arc<Mutex<Option<String>>>);

    impl SchedulerWorkerDelegate for NamedDelegate {
        fn on_main_entry(&self, _worker: &SchedulerWorker, _detach_duration: Duration) {
            *self.0.lock() = thread::current().name().map(str::to_string);
        }
        fn get_work(&self, _worker: &SchedulerWorker) -> Option<Arc<Sequence>> {
            None
        }
        fn did_run_task_with_priority(&self, _priority: TaskPriority, _latency: Duration) {}
        fn re_enqueue_sequence(&self, _sequence: Arc<Sequence>) {}
        fn get_sleep_timeout(&self) -> Duration {
            Duration::MAX
        }
        fn can_detach(&self, _worker: &SchedulerWorker) -> bool {
            false
        }
        fn thread_name(&self, _worker: &SchedulerWorker) -> String {
            "named-worker".to_string()
        }
    }

    let observed = Arc::new(Mutex::new(None));
    let worker = SchedulerWorker::try_new(
        ThreadPriority::Normal,
        Box::new(NamedDelegate(Arc::clone(&observed))),
        Arc::new(TaskTracker::new()),
        InitialState::Alive,
    )?;

    wait_until(|| observed.lock().is_some())?;
    assert_eq!(observed.lock().as_deref(), Some("named-worker"));

    worker.join_for_testing()
}

// Records the OS priority of the worker thread in every callback.
struct PriorityDelegate(Tracker);

impl SchedulerWorkerDelegate for PriorityDelegate {
    fn on_main_entry(&self, _worker: &SchedulerWorker, detach_duration: Duration) {
        self.0.record(
            Method::OnMainEntry,
            Call::OnMainEntry {
                detach_duration,
                priority: current_thread_priority(),
            },
        );
    }

    fn get_work(&self, _worker: &SchedulerWorker) -> Option<Arc<Sequence>> {
        self.0.record(
            Method::GetWork,
            Call::GetWork {
                returned_work: false,
                priority: current_thread_priority(),
            },
        );
        None
    }

    fn did_run_task_with_priority(&self, _priority: TaskPriority, _latency: Duration) {}

    fn re_enqueue_sequence(&self, _sequence: Arc<Sequence>) {}

    fn get_sleep_timeout(&self) -> Duration {
        Duration::MAX
    }

    fn can_detach(&self, _worker: &SchedulerWorker) -> bool {
        false
    }
}

fn observed_priorities(tracker: &Tracker, method: Method) -> Vec<ThreadPriority> {
    tracker
        .get_calls(&method)
        .into_iter()
        .filter_map(|call| match call {
            Call::OnMainEntry { priority, .. } | Call::GetWork { priority, .. } => Some(priority),
            _ => None,
        })
        .collect()
}

#[test]
fn test_bump_priority_of_alive_thread_during_shutdown() -> Result<()> {
    init_tracing();
    let tracker = Tracker::new();
    let task_tracker = Arc::new(TaskTracker::new());

    let worker = SchedulerWorker::try_new(
        ThreadPriority::Background,
        Box::new(PriorityDelegate(tracker.clone())),
        Arc::clone(&task_tracker),
        InitialState::Alive,
    )?;

    // Without a way back up, background workers run at NORMAL all along.
    let initial = if can_increase_current_thread_priority() && cfg!(target_os = "linux") {
        ThreadPriority::Background
    } else {
        ThreadPriority::Normal
    };

    worker.wake_up();
    tracker.wait_for_calls(Method::GetWork, 1)?;
    assert_eq!(observed_priorities(&tracker, Method::OnMainEntry), vec![initial]);
    assert_eq!(observed_priorities(&tracker, Method::GetWork), vec![initial]);

    task_tracker.set_has_shutdown_started_for_testing();
    worker.wake_up();
    tracker.wait_for_calls(Method::GetWork, 2)?;
    assert_eq!(
        observed_priorities(&tracker, Method::GetWork).last(),
        Some(&ThreadPriority::Normal)
    );

    worker.join_for_testing()
}

#[test]
fn test_bump_priority_of_detached_thread_during_shutdown() -> Result<()> {
    init_tracing();
    let tracker = Tracker::new();
    let task_tracker = Arc::new(TaskTracker::new());

    let worker = SchedulerWorker::try_new(
        ThreadPriority::Background,
        Box::new(PriorityDelegate(tracker.clone())),
        Arc::clone(&task_tracker),
        InitialState::Detached,
    )?;

    task_tracker.set_has_shutdown_started_for_testing();

    // The new thread starts at NORMAL.
    worker.wake_up();
    tracker.wait_for_calls(Method::GetWork, 1)?;

    assert_eq!(
        observed_priorities(&tracker, Method::OnMainEntry),
        vec![ThreadPriority::Normal]
    );
    assert_eq!(
        observed_priorities(&tracker, Method::GetWork),
        vec![ThreadPriority::Normal]
    );

    worker.join_for_testing()
}

#[rstest]
#[case::background(ThreadPriority::Background)]
#[case::normal(ThreadPriority::Normal)]
fn test_desired_priority_is_normal_once_shutdown_started(
    #[case] priority_hint: ThreadPriority,
) -> Result<()> {
    let task_tracker = Arc::new(TaskTracker::new());
    let worker = SchedulerWorker::try_new(
        priority_hint,
        Box::new(PriorityDelegate(Tracker::new())),
        Arc::clone(&task_tracker),
        InitialState::Detached,
    )?;

    let before_shutdown =
        if priority_hint == ThreadPriority::Background && can_increase_current_thread_priority() {
            ThreadPriority::Background
        } else {
            ThreadPriority::Normal
        };
    assert_eq!(worker.desired_thread_priority(), before_shutdown);

    task_tracker.set_has_shutdown_started_for_testing();
    assert_eq!(worker.desired_thread_priority(), ThreadPriority::Normal);
    Ok(())
}

#[test]
fn test_spawn_failure() -> Result<()> {
    init_tracing();
    let tracker = Tracker::new();
    let task_tracker = Arc::new(TaskTracker::new());
    let new_worker = |initial_state| {
        SchedulerWorker::try_new(
            ThreadPriority::Normal,
            Box::new(PriorityDelegate(tracker.clone())),
            Arc::clone(&task_tracker),
            initial_state,
        )
    };

    let detached = new_worker(InitialState::Detached)?;

    fail_spawn_after_for_testing(Some(0));
    let alive = new_worker(InitialState::Alive);
    detached.wake_up();
    fail_spawn_after_for_testing(None);

    let err = alive
        .err()
        .ok_or_else(|| anyhow!("creating an alive worker should have failed"))?;
    assert!(matches!(
        err.downcast_ref::<SchedulerError>(),
        Some(SchedulerError::WorkerSpawn { .. })
    ));

    // A failed re-attach leaves the worker detached, the next wake up retries.
    assert!(!detached.thread_alive_for_testing());
    assert_eq!(tracker.num_calls(&Method::OnMainEntry), 0);

    detached.wake_up();
    tracker.wait_for_calls(Method::GetWork, 1)?;
    assert!(detached.thread_alive_for_testing());

    detached.join_for_testing()
}
