use crate::sequence::SortKey;
use crate::task::{SequenceToken, Task, TaskPriority, TaskTraits};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Instant;

/// An ordered queue of tasks that run one at a time, in push order.
///
/// A non-empty sequence is always referenced by exactly one priority queue or
/// by the one worker running its front task. The front slot stays occupied
/// (as `None`) between [`Sequence::take_task`] and [`Sequence::pop`], so a
/// concurrent [`Sequence::push_task`] sees a non-empty sequence and does not
/// schedule it a second time.
#[derive(Debug)]
pub(crate) struct Sequence {
    token: SequenceToken,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    queue: VecDeque<Option<Task>>,
    num_tasks_per_priority: [usize; TaskPriority::COUNT],
}

impl Sequence {
    pub(crate) fn new() -> Self {
        Self {
            token: SequenceToken::next(),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub(crate) fn token(&self) -> SequenceToken {
        self.token
    }

    /// Adds `task` at the back. Returns true if the sequence was empty, in
    /// which case the caller is responsible for scheduling it.
    pub(crate) fn push_task(&self, mut task: Task) -> bool {
        task.sequenced_time = Instant::now();

        let mut inner = self.inner.lock();
        inner.num_tasks_per_priority[task.traits.priority().as_index()] += 1;
        inner.queue.push_back(Some(task));

        inner.queue.len() == 1
    }

    /// Moves the front task out. Its slot stays in place until
    /// [`Sequence::pop`] is called.
    pub(crate) fn take_task(&self) -> Option<Task> {
        let mut inner = self.inner.lock();
        let task = inner.queue.front_mut()?.take()?;

        inner.num_tasks_per_priority[task.traits.priority().as_index()] -= 1;
        Some(task)
    }

    /// Traits of the front task, `None` if the sequence is empty or its front
    /// task was taken.
    pub(crate) fn peek_task_traits(&self) -> Option<TaskTraits> {
        let inner = self.inner.lock();
        inner.queue.front()?.as_ref().map(|task| task.traits)
    }

    /// Removes the front slot. Returns true if the sequence is now empty.
    pub(crate) fn pop(&self) -> bool {
        let mut inner = self.inner.lock();
        debug_assert!(
            matches!(inner.queue.front(), Some(None)),
            "pop() without a prior take_task()"
        );

        inner.queue.pop_front();
        inner.queue.is_empty()
    }

    /// Highest priority among the queued tasks, timed by the front task.
    pub(crate) fn sort_key(&self) -> SortKey {
        let inner = self.inner.lock();

        let priority = TaskPriority::ALL
            .iter()
            .rev()
            .copied()
            .find(|p| inner.num_tasks_per_priority[p.as_index()] > 0)
            .unwrap_or_default();

        let next_task_sequenced_time = inner
            .queue
            .front()
            .and_then(|slot| slot.as_ref())
            .map_or_else(Instant::now, |task| task.sequenced_time);

        SortKey::new(priority, next_task_sequenced_time)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Empties the sequence and returns its queued tasks, which never run.
    ///
    /// Task closures may own handles to this very sequence, so the caller
    /// drops them after the lock was released.
    pub(crate) fn clear(&self) -> Vec<Task> {
        let queue = {
            let mut inner = self.inner.lock();
            inner.num_tasks_per_priority = [0; TaskPriority::COUNT];
            std::mem::take(&mut inner.queue)
        };

        queue.into_iter().flatten().collect()
    }
}
