use crate::errors::SchedulerError;
use crate::pool::{SchedulerWorkerPoolParams, StandbyThreadPolicy};
use crate::scheduler::TaskScheduler;
use crate::task::{TaskPriority, TaskTraits};
use crate::utils::ThreadPriority;
use anyhow::Result;
use std::collections::HashSet;
use std::convert::TryFrom;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread;

/// Name of the thread waiting on delayed tasks. Kept under 15 bytes so the OS
/// does not truncate it.
const DEFAULT_SERVICE_THREAD_NAME: &str = "threadline-svc";

// Pools of `Builder::new_default`, in the order `default_pool_index_for_traits`
// expects.
const BACKGROUND_POOL: usize = 0;
const BACKGROUND_BLOCKING_POOL: usize = 1;
const FOREGROUND_POOL: usize = 2;
const FOREGROUND_BLOCKING_POOL: usize = 3;

/// Maps the traits of a task to the index of the pool it runs in.
#[derive(Clone)]
pub(crate) struct WorkerPoolIndexForTraitsFn(
    pub(crate) Arc<dyn Fn(&TaskTraits) -> usize + Send + Sync + 'static>,
);

impl fmt::Debug for WorkerPoolIndexForTraitsFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WorkerPoolIndexForTraitsFn")
            .field(&"<function>")
            .finish()
    }
}

/// `2 * (priority != Background) + may_block`, matching the pools of
/// [`Builder::new_default`].
pub fn default_pool_index_for_traits(traits: &TaskTraits) -> usize {
    let background = traits.priority() == TaskPriority::Background;

    match (background, traits.may_block()) {
        (true, false) => BACKGROUND_POOL,
        (true, true) => BACKGROUND_BLOCKING_POOL,
        (false, false) => FOREGROUND_POOL,
        (false, true) => FOREGROUND_BLOCKING_POOL,
    }
}

#[derive(Debug)]
pub struct Builder {
    /// One entry per pool, in index order.
    worker_pools: Vec<SchedulerWorkerPoolParams>,

    /// Required, tasks have nowhere to go without it.
    worker_pool_index_for_traits: Option<WorkerPoolIndexForTraitsFn>,

    service_thread_name: String,
}

impl Builder {
    /// A builder without any pool. At least one pool and a traits to pool
    /// mapping must be configured before [`Builder::try_build`].
    pub fn new() -> Builder {
        Builder {
            worker_pools: Vec::new(),
            worker_pool_index_for_traits: None,
            service_thread_name: DEFAULT_SERVICE_THREAD_NAME.to_string(),
        }
    }

    /// Four pools sized after the available parallelism: background,
    /// background blocking, foreground and foreground blocking. Tasks are
    /// mapped with [`default_pool_index_for_traits`].
    pub fn new_default() -> Builder {
        let cores = thread::available_parallelism().map_or(1, NonZeroUsize::get);

        Builder::new()
            .worker_pool(
                SchedulerWorkerPoolParams::new("bg", cores.div_ceil(4))
                    .priority_hint(ThreadPriority::Background)
                    .standby_thread_policy(StandbyThreadPolicy::Lazy),
            )
            .worker_pool(
                SchedulerWorkerPoolParams::new("bg-blocking", cores.div_ceil(2))
                    .priority_hint(ThreadPriority::Background)
                    .standby_thread_policy(StandbyThreadPolicy::Lazy),
            )
            .worker_pool(SchedulerWorkerPoolParams::new("fg", cores))
            .worker_pool(SchedulerWorkerPoolParams::new("fg-blocking", 2 * cores))
            .worker_pool_index_for_traits(default_pool_index_for_traits)
    }

    /// Appends a pool. Its index is the number of pools added before it.
    pub fn worker_pool(mut self, params: SchedulerWorkerPoolParams) -> Self {
        self.worker_pools.push(params);
        self
    }

    /// Called on every post to pick a pool. Must return an index below the
    /// number of pools and must not block.
    pub fn worker_pool_index_for_traits<F>(mut self, f: F) -> Self
    where
        F: Fn(&TaskTraits) -> usize + Send + Sync + 'static,
    {
        self.worker_pool_index_for_traits = Some(WorkerPoolIndexForTraitsFn(Arc::new(f)));
        self
    }

    pub fn service_thread_name(mut self, name: impl Into<String>) -> Self {
        self.service_thread_name = name.into();
        self
    }

    /// Spawns the worker threads required by each pool's standby policy and
    /// the service thread. Fails if the configuration is invalid or a thread
    /// cannot be spawned, in which case no thread is left running.
    pub fn try_build(self) -> Result<TaskScheduler> {
        let cfg = SchedulerConfig::try_from(self)?;
        TaskScheduler::try_new(cfg)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Builder::new_default()
    }
}

/// Validated form of a [`Builder`].
#[derive(Debug, Clone)]
pub(crate) struct SchedulerConfig {
    pub(crate) worker_pools: Vec<SchedulerWorkerPoolParams>,
    pub(crate) worker_pool_index_for_traits: WorkerPoolIndexForTraitsFn,
    pub(crate) service_thread_name: String,
}

impl SchedulerConfig {
    fn validate(&self) -> Result<(), SchedulerError> {
        if self.worker_pools.is_empty() {
            return Err(SchedulerError::InvalidConfig(
                "at least one worker pool is required".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for params in &self.worker_pools {
            if params.name().is_empty() {
                return Err(SchedulerError::InvalidConfig(
                    "worker pool names must not be empty".to_string(),
                ));
            }

            if params.max_threads() == 0 {
                return Err(SchedulerError::InvalidConfig(format!(
                    "worker pool {} must have at least one thread",
                    params.name()
                )));
            }

            if !names.insert(params.name()) {
                return Err(SchedulerError::InvalidConfig(format!(
                    "duplicate worker pool name {}",
                    params.name()
                )));
            }
        }

        if self.service_thread_name.is_empty() {
            return Err(SchedulerError::InvalidConfig(
                "service thread name must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl TryFrom<Builder> for SchedulerConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let worker_pool_index_for_traits = builder.worker_pool_index_for_traits.ok_or_else(|| {
            SchedulerError::InvalidConfig("no worker pool index for traits mapping".to_string())
        })?;

        let cfg = SchedulerConfig {
            worker_pools: builder.worker_pools,
            worker_pool_index_for_traits,
            service_thread_name: builder.service_thread_name,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}
