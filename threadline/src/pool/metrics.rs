use crate::task::TaskPriority;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters updated by a pool's worker threads.
#[derive(Debug, Default)]
pub(crate) struct PoolMetrics {
    per_priority: [PriorityMetrics; TaskPriority::COUNT],
    num_detaches: AtomicU64,
    detach_duration_us: AtomicU64,
}

#[derive(Debug, Default)]
struct PriorityMetrics {
    tasks_run: AtomicU64,
    latency_us: AtomicU64,
    max_latency_us: AtomicU64,
}

fn as_micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

impl PoolMetrics {
    pub(crate) fn record_task(&self, priority: TaskPriority, latency: Duration) {
        let metrics = &self.per_priority[priority.as_index()];
        let latency = as_micros(latency);

        metrics.tasks_run.fetch_add(1, Ordering::Relaxed);
        metrics.latency_us.fetch_add(latency, Ordering::Relaxed);
        metrics.max_latency_us.fetch_max(latency, Ordering::Relaxed);
    }

    pub(crate) fn record_detach(&self) {
        self.num_detaches.fetch_add(1, Ordering::Relaxed);
    }

    /// How long a worker went without a thread before being re-attached.
    pub(crate) fn record_detach_duration(&self, duration: Duration) {
        self.detach_duration_us
            .fetch_add(as_micros(duration), Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ([PriorityStats; TaskPriority::COUNT], u64, Duration) {
        let per_priority = std::array::from_fn(|i| {
            let m = &self.per_priority[i];
            PriorityStats {
                tasks_run: m.tasks_run.load(Ordering::Relaxed),
                total_latency: Duration::from_micros(m.latency_us.load(Ordering::Relaxed)),
                max_latency: Duration::from_micros(m.max_latency_us.load(Ordering::Relaxed)),
            }
        });

        (
            per_priority,
            self.num_detaches.load(Ordering::Relaxed),
            Duration::from_micros(self.detach_duration_us.load(Ordering::Relaxed)),
        )
    }
}

/// Task counters for one [`TaskPriority`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PriorityStats {
    pub tasks_run: u64,
    pub total_latency: Duration,
    pub max_latency: Duration,
}

/// Point-in-time view of a worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub name: String,
    pub num_workers: usize,
    pub num_alive_workers: usize,
    pub num_idle_workers: usize,
    pub num_detaches: u64,
    pub total_detach_duration: Duration,
    per_priority: [PriorityStats; TaskPriority::COUNT],
}

impl PoolStats {
    pub(crate) fn new(
        name: String,
        num_workers: usize,
        num_alive_workers: usize,
        num_idle_workers: usize,
        metrics: &PoolMetrics,
    ) -> Self {
        let (per_priority, num_detaches, total_detach_duration) = metrics.snapshot();

        Self {
            name,
            num_workers,
            num_alive_workers,
            num_idle_workers,
            num_detaches,
            total_detach_duration,
            per_priority,
        }
    }

    pub fn for_priority(&self, priority: TaskPriority) -> PriorityStats {
        self.per_priority[priority.as_index()]
    }

    pub fn tasks_run(&self) -> u64 {
        self.per_priority.iter().map(|p| p.tasks_run).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_per_priority() {
        let metrics = PoolMetrics::default();
        metrics.record_task(TaskPriority::Background, Duration::from_millis(3));
        metrics.record_task(TaskPriority::Background, Duration::from_millis(5));
        metrics.record_task(TaskPriority::UserBlocking, Duration::from_millis(1));
        metrics.record_detach();
        metrics.record_detach_duration(Duration::from_millis(7));

        let stats = PoolStats::new("bg".to_string(), 2, 1, 1, &metrics);

        let background = stats.for_priority(TaskPriority::Background);
        assert_eq!(background.tasks_run, 2);
        assert_eq!(background.total_latency, Duration::from_millis(8));
        assert_eq!(background.max_latency, Duration::from_millis(5));

        assert_eq!(stats.for_priority(TaskPriority::UserVisible).tasks_run, 0);
        assert_eq!(stats.tasks_run(), 3);
        assert_eq!(stats.num_detaches, 1);
        assert_eq!(stats.total_detach_duration, Duration::from_millis(7));
    }
}
