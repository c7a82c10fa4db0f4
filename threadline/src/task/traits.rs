use bitflags::bitflags;
use std::fmt;

/// How urgent a task is. Ordered from least to most important.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum TaskPriority {
    /// The user will not notice if this takes an arbitrarily long time.
    Background,

    /// The result is visible to the user but not blocking an interaction.
    #[default]
    UserVisible,

    /// The user is waiting on this.
    UserBlocking,
}

impl TaskPriority {
    pub(crate) const COUNT: usize = 3;

    pub(crate) fn as_index(self) -> usize {
        self as usize
    }

    pub(crate) const ALL: [TaskPriority; Self::COUNT] = [
        TaskPriority::Background,
        TaskPriority::UserVisible,
        TaskPriority::UserBlocking,
    ];
}

/// What happens to a task when shutdown starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TaskShutdownBehavior {
    /// Refused once shutdown started. Skipped if it had not started running
    /// when shutdown started. A running task does not block shutdown, so it
    /// may be abandoned mid-flight when the process exits.
    ContinueOnShutdown,

    /// Refused once shutdown started. Skipped if it had not started running
    /// when shutdown started. A running task blocks shutdown until it returns.
    #[default]
    SkipOnShutdown,

    /// Accepted while shutdown is in progress and always run. Shutdown waits
    /// for every such task, from post until completion.
    BlockShutdown,
}

bitflags! {
    /// Execution hints used to route a task to a pool.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TaskHints: u8 {
        /// The task may block on I/O, e.g. reading a file.
        const MAY_BLOCK = 1;

        /// The task may wait on synchronization primitives held by other
        /// tasks.
        const WITH_SYNC_PRIMITIVES = 1 << 1;
    }
}

/// Metadata describing how a task should be scheduled.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TaskTraits {
    priority: TaskPriority,
    shutdown_behavior: TaskShutdownBehavior,
    hints: TaskHints,
}

impl TaskTraits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_shutdown_behavior(mut self, behavior: TaskShutdownBehavior) -> Self {
        self.shutdown_behavior = behavior;
        self
    }

    pub fn with_may_block(mut self) -> Self {
        self.hints |= TaskHints::MAY_BLOCK;
        self
    }

    pub fn with_hints(mut self, hints: TaskHints) -> Self {
        self.hints |= hints;
        self
    }

    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    pub fn shutdown_behavior(&self) -> TaskShutdownBehavior {
        self.shutdown_behavior
    }

    pub fn hints(&self) -> TaskHints {
        self.hints
    }

    pub fn may_block(&self) -> bool {
        self.hints.contains(TaskHints::MAY_BLOCK)
    }

    pub fn allows_sync_primitives(&self) -> bool {
        self.hints.contains(TaskHints::WITH_SYNC_PRIMITIVES)
    }
}

impl fmt::Debug for TaskTraits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskTraits")
            .field("priority", &self.priority)
            .field("shutdown_behavior", &self.shutdown_behavior)
            .field("may_block", &self.may_block())
            .field("sync_primitives", &self.allows_sync_primitives())
            .finish()
    }
}

/// How tasks posted through a task runner relate to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    /// No ordering. Tasks may run concurrently.
    Parallel,

    /// Tasks run one at a time in posting order, possibly on different
    /// threads.
    Sequenced,

    /// Tasks run one at a time in posting order, always on the same thread.
    SingleThreaded,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_defaults() {
        let traits = TaskTraits::new();

        assert_eq!(traits.priority(), TaskPriority::UserVisible);
        assert_eq!(
            traits.shutdown_behavior(),
            TaskShutdownBehavior::SkipOnShutdown
        );
        assert!(!traits.may_block());
        assert!(!traits.allows_sync_primitives());
    }

    #[test]
    fn test_with_priority_copies() {
        let base = TaskTraits::new().with_may_block();
        let bumped = base.with_priority(TaskPriority::UserBlocking);

        assert_eq!(base.priority(), TaskPriority::UserVisible);
        assert_eq!(bumped.priority(), TaskPriority::UserBlocking);
        assert!(bumped.may_block());
    }

    #[rstest]
    #[case(TaskPriority::Background, TaskPriority::UserVisible)]
    #[case(TaskPriority::UserVisible, TaskPriority::UserBlocking)]
    #[case(TaskPriority::Background, TaskPriority::UserBlocking)]
    fn test_priority_ordering(#[case] lower: TaskPriority, #[case] higher: TaskPriority) {
        assert!(lower < higher);
        assert!(lower.as_index() < higher.as_index());
    }

    #[test]
    fn test_hints_accumulate() {
        let traits = TaskTraits::new()
            .with_hints(TaskHints::WITH_SYNC_PRIMITIVES)
            .with_may_block();

        assert_eq!(
            traits.hints(),
            TaskHints::MAY_BLOCK | TaskHints::WITH_SYNC_PRIMITIVES
        );
    }
}
