mod id;
pub(crate) use id::{PoolId, WorkerId};
pub use id::SequenceToken;

mod traits;
pub use traits::{ExecutionMode, TaskHints, TaskPriority, TaskShutdownBehavior, TaskTraits};

#[allow(clippy::module_inception)]
mod task;
pub(crate) use task::Task;
pub use task::{Closure, Location};
