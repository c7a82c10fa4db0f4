mod builder;
pub use builder::{Builder, default_pool_index_for_traits};

#[allow(clippy::module_inception)]
mod scheduler;
pub use scheduler::TaskScheduler;
