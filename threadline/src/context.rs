use crate::pool::TaskRunner;
use crate::task::{PoolId, SequenceToken, WorkerId};
use std::cell::{Cell, RefCell};
use std::sync::Arc;
use std::thread_local;

// Per-thread scheduling state. Worker threads set their pool and worker
// identity once per thread, task state is swapped around every task.
struct Context {
    pool: Cell<Option<PoolId>>,
    worker: Cell<Option<WorkerId>>,
    sequence_token: Cell<Option<SequenceToken>>,
    task_runner: RefCell<Option<Arc<dyn TaskRunner>>>,
}

impl Context {
    const fn new() -> Self {
        Self {
            pool: Cell::new(None),
            worker: Cell::new(None),
            sequence_token: Cell::new(None),
            task_runner: RefCell::new(None),
        }
    }
}

thread_local! {
    static CONTEXT: Context = const { Context::new() };
}

pub(crate) fn set_current_worker(worker: Option<WorkerId>) {
    CONTEXT.with(|ctx| ctx.worker.set(worker));
}

pub(crate) fn current_worker() -> Option<WorkerId> {
    CONTEXT.with(|ctx| ctx.worker.get())
}

pub(crate) fn set_current_pool(pool: Option<PoolId>) {
    CONTEXT.with(|ctx| ctx.pool.set(pool));
}

pub(crate) fn current_pool() -> Option<PoolId> {
    CONTEXT.with(|ctx| ctx.pool.get())
}

/// Token of the sequence whose task is running on this thread.
pub fn current_sequence_token() -> Option<SequenceToken> {
    CONTEXT.with(|ctx| ctx.sequence_token.get())
}

/// Sequenced or single-threaded runner of the task running on this thread.
///
/// `None` outside of a task, and for tasks posted without such a runner.
pub fn current_task_runner() -> Option<Arc<dyn TaskRunner>> {
    CONTEXT.with(|ctx| ctx.task_runner.borrow().clone())
}

/// Exposes a task's sequence and runner for the duration of its execution,
/// then restores whatever was there before.
pub(crate) struct TaskContextGuard {
    prev_token: Option<SequenceToken>,
    prev_runner: Option<Arc<dyn TaskRunner>>,
}

impl TaskContextGuard {
    pub(crate) fn enter(token: SequenceToken, runner: Option<Arc<dyn TaskRunner>>) -> Self {
        CONTEXT.with(|ctx| TaskContextGuard {
            prev_token: ctx.sequence_token.replace(Some(token)),
            prev_runner: ctx.task_runner.replace(runner),
        })
    }
}

impl Drop for TaskContextGuard {
    fn drop(&mut self) {
        let prev_token = self.prev_token.take();
        let prev_runner = self.prev_runner.take();

        // The runner may be the last reference to a pool, drop it outside of
        // the thread local borrow.
        let _released = CONTEXT.with(|ctx| {
            ctx.sequence_token.set(prev_token);
            ctx.task_runner.replace(prev_runner)
        });
    }
}
