use crate::utils::ThreadPriority;
use std::time::Duration;

/// Idle threads are reclaimed after this long by default.
const DEFAULT_SUGGESTED_RECLAIM_TIME: Duration = Duration::from_secs(30);

/// How many workers of a pool get a thread before any work is posted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StandbyThreadPolicy {
    /// Every worker starts detached.
    Lazy,

    /// Worker 0 starts with a thread, the others start detached.
    #[default]
    One,

    /// Every worker starts with a thread.
    All,
}

/// Configuration of one worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerWorkerPoolParams {
    name: String,
    priority_hint: ThreadPriority,
    standby_thread_policy: StandbyThreadPolicy,
    max_threads: usize,
    suggested_reclaim_time: Duration,
}

impl SchedulerWorkerPoolParams {
    /// `name` is used for thread names and logging, it should be short since
    /// thread names are truncated to 15 bytes.
    pub fn new(name: impl Into<String>, max_threads: usize) -> Self {
        Self {
            name: name.into(),
            priority_hint: ThreadPriority::default(),
            standby_thread_policy: StandbyThreadPolicy::default(),
            max_threads,
            suggested_reclaim_time: DEFAULT_SUGGESTED_RECLAIM_TIME,
        }
    }

    /// OS priority of the pool's threads. Background threads are bumped to
    /// normal priority once shutdown starts.
    pub fn priority_hint(mut self, priority_hint: ThreadPriority) -> Self {
        self.priority_hint = priority_hint;
        self
    }

    pub fn standby_thread_policy(mut self, policy: StandbyThreadPolicy) -> Self {
        self.standby_thread_policy = policy;
        self
    }

    /// How long a worker stays idle before its thread may be released.
    /// `Duration::MAX` never releases threads.
    pub fn suggested_reclaim_time(mut self, reclaim_time: Duration) -> Self {
        self.suggested_reclaim_time = reclaim_time;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    pub fn get_priority_hint(&self) -> ThreadPriority {
        self.priority_hint
    }

    pub fn get_standby_thread_policy(&self) -> StandbyThreadPolicy {
        self.standby_thread_policy
    }

    pub fn get_suggested_reclaim_time(&self) -> Duration {
        self.suggested_reclaim_time
    }
}
