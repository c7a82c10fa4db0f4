use crate::task::TaskPriority;
use std::cmp::Ordering;
use std::time::Instant;

/// Ranks sequences against each other. A greater key is more important:
/// higher priority first, then the earlier sequenced front task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SortKey {
    priority: TaskPriority,
    next_task_sequenced_time: Instant,
}

impl SortKey {
    pub(crate) fn new(priority: TaskPriority, next_task_sequenced_time: Instant) -> Self {
        Self {
            priority,
            next_task_sequenced_time,
        }
    }

    pub(crate) fn priority(&self) -> TaskPriority {
        self.priority
    }

    pub(crate) fn next_task_sequenced_time(&self) -> Instant {
        self.next_task_sequenced_time
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.cmp(&other.priority).then_with(|| {
            other
                .next_task_sequenced_time
                .cmp(&self.next_task_sequenced_time)
        })
    }
}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_priority_dominates_time() {
        let now = Instant::now();
        let later = now + Duration::from_secs(1);

        let old_background = SortKey::new(TaskPriority::Background, now);
        let new_blocking = SortKey::new(TaskPriority::UserBlocking, later);

        assert!(new_blocking > old_background);
    }

    #[test]
    fn test_earlier_time_wins_on_equal_priority() {
        let now = Instant::now();
        let later = now + Duration::from_millis(1);

        let first = SortKey::new(TaskPriority::UserVisible, now);
        let second = SortKey::new(TaskPriority::UserVisible, later);

        assert!(first > second);
        assert_eq!(first.cmp(&first), Ordering::Equal);
    }
}
