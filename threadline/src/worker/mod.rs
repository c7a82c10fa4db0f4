mod delegate;
pub(crate) use delegate::SchedulerWorkerDelegate;

#[allow(clippy::module_inception)]
mod worker;
pub(crate) use worker::{InitialState, SchedulerWorker};
#[cfg(test)]
pub(crate) use worker::fail_spawn_after_for_testing;

#[cfg(test)]
mod tests;
