#![allow(unused)]

use crate::task::{SequenceToken, TaskPriority};
use crate::utils::ThreadPriority;
use anyhow::{Result, anyhow};
use dashmap::DashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Upper bound for any test waiting on a worker thread to make progress.
pub(crate) const TEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Method {
    OnMainEntry,
    GetWork,
    DidRunTask,
    ReEnqueueSequence,
    CanDetach,
    OnDetach,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    OnMainEntry {
        detach_duration: Duration,
        priority: ThreadPriority,
    },
    GetWork {
        returned_work: bool,
        priority: ThreadPriority,
    },
    DidRunTask {
        priority: TaskPriority,
    },
    ReEnqueueSequence {
        token: SequenceToken,
        num_tasks: usize,
    },
    CanDetach {
        allowed: bool,
    },
    OnDetach,
}

/// Records delegate calls made on worker threads so the test thread can wait
/// for them and assert on them.
#[derive(Debug, Clone)]
pub(crate) struct Tracker {
    calls: Arc<DashMap<Method, Vec<Call>>>,
}

impl Tracker {
    pub(crate) fn new() -> Self {
        let map = DashMap::new();
        map.insert(Method::OnMainEntry, Vec::new());
        map.insert(Method::GetWork, Vec::new());
        map.insert(Method::DidRunTask, Vec::new());
        map.insert(Method::ReEnqueueSequence, Vec::new());
        map.insert(Method::CanDetach, Vec::new());
        map.insert(Method::OnDetach, Vec::new());

        Self {
            calls: Arc::new(map),
        }
    }

    pub(crate) fn record(&self, method: Method, call: Call) {
        self.calls
            .get_mut(&method)
            .expect("method not found")
            .push(call)
    }

    pub(crate) fn get_calls(&self, method: &Method) -> Vec<Call> {
        self.calls
            .get(method)
            .expect("method not found")
            .value()
            .clone()
    }

    pub(crate) fn num_calls(&self, method: &Method) -> usize {
        self.calls.get(method).map_or(0, |calls| calls.len())
    }

    /// Blocks until `method` was called at least `n` times.
    pub(crate) fn wait_for_calls(&self, method: Method, n: usize) -> Result<()> {
        wait_until(|| self.num_calls(&method) >= n)
            .map_err(|_| anyhow!("timed out waiting for {n} {method:?} calls"))
    }
}

/// Polls `cond` until it holds or [`TEST_TIMEOUT`] elapses.
pub(crate) fn wait_until(cond: impl Fn() -> bool) -> Result<()> {
    let deadline = Instant::now() + TEST_TIMEOUT;

    while !cond() {
        if Instant::now() > deadline {
            return Err(anyhow!("condition not met within {:?}", TEST_TIMEOUT));
        }
        thread::sleep(Duration::from_millis(1));
    }

    Ok(())
}
