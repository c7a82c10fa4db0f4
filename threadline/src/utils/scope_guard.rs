/// Runs a closure when dropped, unless disarmed first.
///
/// The task tracker uses this to release shutdown-blocking and flush counts
/// even when a task closure unwinds out of the worker loop.
pub(crate) struct ScopeGuard<F: FnOnce()> {
    // `Option` so the closure can be moved out exactly once, either by
    // `disarm` or by `drop`.
    on_exit: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub(crate) fn new(on_exit: F) -> Self {
        ScopeGuard {
            on_exit: Some(on_exit),
        }
    }

    /// Prevents the closure from ever running.
    #[allow(unused)]
    pub(crate) fn disarm(&mut self) {
        self.on_exit.take();
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(on_exit) = self.on_exit.take() {
            on_exit();
        }
    }
}
