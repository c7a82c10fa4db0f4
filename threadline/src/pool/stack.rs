/// LIFO stack of idle workers, identified by their index in the pool.
///
/// The most recently idle worker is woken up first, which leaves the workers
/// at the bottom idle long enough to be reclaimed.
#[derive(Debug, Default)]
pub(crate) struct SchedulerWorkerStack {
    stack: Vec<usize>,
}

impl SchedulerWorkerStack {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// `worker` must not already be on the stack.
    pub(crate) fn push(&mut self, worker: usize) {
        debug_assert!(!self.contains(worker), "worker {worker} pushed twice");
        self.stack.push(worker);
    }

    pub(crate) fn pop(&mut self) -> Option<usize> {
        self.stack.pop()
    }

    pub(crate) fn peek(&self) -> Option<usize> {
        self.stack.last().copied()
    }

    pub(crate) fn contains(&self, worker: usize) -> bool {
        self.stack.contains(&worker)
    }

    pub(crate) fn remove(&mut self, worker: usize) {
        if let Some(pos) = self.stack.iter().position(|&w| w == worker) {
            self.stack.remove(pos);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.stack.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_is_lifo() {
        let mut stack = SchedulerWorkerStack::new();
        assert!(stack.is_empty());

        stack.push(2);
        stack.push(1);
        stack.push(0);
        assert_eq!(stack.len(), 3);
        assert_eq!(stack.peek(), Some(0));

        assert_eq!(stack.pop(), Some(0));
        assert_eq!(stack.pop(), Some(1));
        assert_eq!(stack.pop(), Some(2));
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn test_remove_from_middle() {
        let mut stack = SchedulerWorkerStack::new();
        stack.push(0);
        stack.push(1);
        stack.push(2);

        stack.remove(1);
        assert!(!stack.contains(1));
        assert_eq!(stack.len(), 2);

        // Removing an absent worker is a no-op.
        stack.remove(7);
        assert_eq!(stack.pop(), Some(2));
        assert_eq!(stack.pop(), Some(0));
    }
}
