use crate::task::{Task, TaskTraits};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

mod tracker;
pub(crate) use tracker::{Call, Method, TEST_TIMEOUT, Tracker, wait_until};

/// Installs a `tracing` subscriber honoring `RUST_LOG`. Safe to call from
/// every test.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// An undelayed task which bumps `counter` when it runs.
#[track_caller]
pub(crate) fn counting_task(traits: TaskTraits, counter: &Arc<AtomicUsize>) -> Task {
    let counter = Arc::clone(counter);
    Task::new(
        std::panic::Location::caller(),
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
        traits,
        Duration::ZERO,
    )
}
