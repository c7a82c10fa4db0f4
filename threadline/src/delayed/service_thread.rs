use crate::errors::SchedulerError;
use crate::utils::time::deadline_after;
use anyhow::Result;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// A dedicated thread running jobs once their deadline passes. Jobs with the
/// same deadline run in posting order.
pub(crate) struct ServiceThread {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    state: Mutex<State>,
    cv: Condvar,
}

#[derive(Default)]
struct State {
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    jobs: HashMap<u64, Job>,
    next_id: u64,
    stopped: bool,
}

impl ServiceThread {
    pub(crate) fn try_new(name: impl Into<String>) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            cv: Condvar::new(),
        });

        let handle = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(name.into())
                .spawn(move || shared.run())
                .map_err(SchedulerError::ServiceThreadSpawn)?
        };

        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Runs `job` on the service thread after `delay`. Returns false once the
    /// thread was stopped, `job` is dropped then.
    pub(crate) fn post_delayed(&self, job: Job, delay: Duration) -> bool {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return false;
        }

        let deadline = deadline_after(Instant::now(), delay);

        let id = state.next_id;
        state.next_id += 1;
        state.jobs.insert(id, job);
        state.deadlines.push(Reverse((deadline, id)));

        self.shared.cv.notify_one();
        true
    }

    /// Stops and joins the thread. Jobs that did not run yet are dropped.
    pub(crate) fn stop(&self) {
        let pending = {
            let mut state = self.shared.state.lock();
            state.stopped = true;
            state.deadlines.clear();
            self.shared.cv.notify_one();
            std::mem::take(&mut state.jobs)
        };

        if !pending.is_empty() {
            debug!(num_jobs = pending.len(), "dropping pending delayed jobs");
        }
        drop(pending);

        if let Some(handle) = self.handle.lock().take()
            && handle.join().is_err()
        {
            debug!("service thread panicked");
        }
    }

    #[cfg(test)]
    pub(crate) fn num_pending_for_testing(&self) -> usize {
        self.shared.state.lock().jobs.len()
    }
}

impl Drop for ServiceThread {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn run(&self) {
        trace!("service thread started");
        let mut state = self.state.lock();

        while !state.stopped {
            let next = state.deadlines.peek().map(|Reverse(entry)| *entry);

            match next {
                Some((deadline, id)) if deadline <= Instant::now() => {
                    state.deadlines.pop();
                    if let Some(job) = state.jobs.remove(&id) {
                        MutexGuard::unlocked(&mut state, job);
                    }
                }
                Some((deadline, _)) => {
                    self.cv.wait_until(&mut state, deadline);
                }
                None => self.cv.wait(&mut state),
            }
        }

        trace!("service thread exiting");
    }
}
