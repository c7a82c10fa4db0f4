//! A thread pool task scheduler.
//!
//! Tasks are posted with [`TaskTraits`] which pick the worker pool they run
//! on and how they interact with shutdown. A [`TaskRunner`] created with an
//! [`ExecutionMode`] posts tasks that run in parallel, one after another in
//! post order, or on a single thread.
//!
//! ```no_run
//! use threadline::{Builder, ExecutionMode, TaskRunnerExt, TaskTraits};
//!
//! # fn main() -> anyhow::Result<()> {
//! let scheduler = Builder::new_default().try_build()?;
//!
//! scheduler.post_task_with_traits(TaskTraits::new(), || println!("hello"))?;
//!
//! let runner = scheduler.create_task_runner_with_traits(TaskTraits::new(), ExecutionMode::Sequenced);
//! runner.post_task(|| println!("first"))?;
//! runner.post_task(|| println!("second"))?;
//!
//! scheduler.shutdown();
//! # Ok(())
//! # }
//! ```

mod context;
pub use context::{current_sequence_token, current_task_runner};

mod delayed;

mod errors;
pub use errors::{PostTaskError, SchedulerError};

pub mod pool;
pub use pool::{
    PoolStats, PriorityStats, SchedulerWorkerPoolParams, StandbyThreadPolicy, TaskRunner,
    TaskRunnerExt,
};

pub mod scheduler;
pub use scheduler::{Builder, TaskScheduler};

mod sequence;

pub mod task;
pub use task::{
    ExecutionMode, SequenceToken, TaskHints, TaskPriority, TaskShutdownBehavior, TaskTraits,
};

mod task_tracker;

mod utils;
pub use utils::ThreadPriority;
pub use utils::thread::{can_increase_current_thread_priority, current_thread_priority};

mod worker;

#[cfg(test)]
mod test_utils;
