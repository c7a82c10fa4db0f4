use crate::sequence::{Sequence, SortKey};
use parking_lot::{Mutex, MutexGuard};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

/// Sequences waiting for a worker, most important first.
///
/// All access goes through a [`Transaction`], which holds the queue lock for
/// its whole lifetime so several operations can be made atomic.
#[derive(Debug, Default)]
pub(crate) struct PriorityQueue {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    heap: BinaryHeap<Entry>,

    /// Breaks ties between equal sort keys in insertion order.
    next_insertion: u64,
}

#[derive(Debug)]
struct Entry {
    sort_key: SortKey,
    insertion: u64,
    sequence: Arc<Sequence>,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key
            .cmp(&other.sort_key)
            .then_with(|| other.insertion.cmp(&self.insertion))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PriorityQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn begin_transaction(&self) -> Transaction<'_> {
        Transaction {
            inner: self.inner.lock(),
        }
    }
}

pub(crate) struct Transaction<'a> {
    inner: MutexGuard<'a, Inner>,
}

impl Transaction<'_> {
    pub(crate) fn push(&mut self, sequence: Arc<Sequence>, sort_key: SortKey) {
        let insertion = self.inner.next_insertion;
        self.inner.next_insertion += 1;

        self.inner.heap.push(Entry {
            sort_key,
            insertion,
            sequence,
        });
    }

    pub(crate) fn peek_sort_key(&self) -> Option<SortKey> {
        self.inner.heap.peek().map(|entry| entry.sort_key)
    }

    pub(crate) fn pop_sequence(&mut self) -> Option<Arc<Sequence>> {
        self.inner.heap.pop().map(|entry| entry.sequence)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.heap.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.heap.len()
    }

    /// Drops every queued sequence and the tasks they hold.
    pub(crate) fn clear(&mut self) -> Vec<Arc<Sequence>> {
        self.inner
            .heap
            .drain()
            .map(|entry| entry.sequence)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskPriority;
    use anyhow::{Result, anyhow};
    use rstest::rstest;
    use std::time::{Duration, Instant};

    fn pop_token(txn: &mut Transaction<'_>) -> Result<u64> {
        txn.pop_sequence()
            .map(|s| s.token().as_u64())
            .ok_or_else(|| anyhow!("queue unexpectedly empty"))
    }

    #[test]
    fn test_pops_by_sort_key() -> Result<()> {
        let pq = PriorityQueue::new();
        let now = Instant::now();

        let background = Arc::new(Sequence::new());
        let visible = Arc::new(Sequence::new());
        let blocking = Arc::new(Sequence::new());

        {
            let mut txn = pq.begin_transaction();
            txn.push(
                Arc::clone(&background),
                SortKey::new(TaskPriority::Background, now),
            );
            txn.push(
                Arc::clone(&blocking),
                SortKey::new(TaskPriority::UserBlocking, now + Duration::from_secs(2)),
            );
            txn.push(
                Arc::clone(&visible),
                SortKey::new(TaskPriority::UserVisible, now + Duration::from_secs(1)),
            );
            assert_eq!(txn.len(), 3);
        }

        let mut txn = pq.begin_transaction();
        assert_eq!(
            txn.peek_sort_key().map(|k| k.priority()),
            Some(TaskPriority::UserBlocking)
        );
        assert_eq!(pop_token(&mut txn)?, blocking.token().as_u64());
        assert_eq!(pop_token(&mut txn)?, visible.token().as_u64());
        assert_eq!(pop_token(&mut txn)?, background.token().as_u64());
        assert!(txn.is_empty());
        assert!(txn.pop_sequence().is_none());

        Ok(())
    }

    #[rstest]
    #[case(2)]
    #[case(16)]
    fn test_equal_keys_are_fifo(#[case] n: usize) -> Result<()> {
        let pq = PriorityQueue::new();
        let key = SortKey::new(TaskPriority::UserVisible, Instant::now());

        let sequences = (0..n).map(|_| Arc::new(Sequence::new())).collect::<Vec<_>>();

        let mut txn = pq.begin_transaction();
        for sequence in &sequences {
            txn.push(Arc::clone(sequence), key);
        }

        for sequence in &sequences {
            assert_eq!(pop_token(&mut txn)?, sequence.token().as_u64());
        }

        Ok(())
    }

    #[test]
    fn test_clear_releases_sequences() {
        let pq = PriorityQueue::new();
        let sequence = Arc::new(Sequence::new());

        pq.begin_transaction().push(
            Arc::clone(&sequence),
            SortKey::new(TaskPriority::UserVisible, Instant::now()),
        );
        assert_eq!(Arc::strong_count(&sequence), 2);

        let drained = pq.begin_transaction().clear();
        assert_eq!(drained.len(), 1);
        drop(drained);

        assert_eq!(Arc::strong_count(&sequence), 1);
    }
}
