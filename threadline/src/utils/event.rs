use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// Manual-reset event. Once signaled it stays signaled until `reset()`, and
/// every waiter returns.
#[derive(Debug, Default)]
pub(crate) struct WaitableEvent {
    signaled: Mutex<bool>,
    cv: Condvar,
}

impl WaitableEvent {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn signal(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cv.notify_all();
    }

    pub(crate) fn reset(&self) {
        *self.signaled.lock() = false;
    }

    pub(crate) fn is_signaled(&self) -> bool {
        *self.signaled.lock()
    }

    pub(crate) fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.cv.wait(&mut signaled);
        }
    }

    /// Waits until signaled or until `timeout` elapses. Returns whether the
    /// event was signaled. `Duration::MAX` waits forever.
    pub(crate) fn timed_wait(&self, timeout: Duration) -> bool {
        if timeout == Duration::MAX {
            self.wait();
            return true;
        }

        let mut signaled = self.signaled.lock();
        if !*signaled {
            // Spurious wakeups are absorbed by `wait_while_for`.
            self.cv
                .wait_while_for(&mut signaled, |signaled| !*signaled, timeout);
        }
        *signaled
    }
}
