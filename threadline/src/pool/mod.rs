mod params;
pub use params::{SchedulerWorkerPoolParams, StandbyThreadPolicy};

mod stack;

mod metrics;
pub use metrics::{PoolStats, PriorityStats};

mod runner;
pub use runner::{TaskRunner, TaskRunnerExt};

#[allow(clippy::module_inception)]
mod pool;
pub(crate) use pool::{ReEnqueueSequenceCallback, SchedulerWorkerPool};
