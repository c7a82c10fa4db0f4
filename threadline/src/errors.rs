use crate::task::Location;
use std::io;

/// Why a post was rejected. The closure never runs when one of these is
/// returned.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostTaskError {
    /// Shutdown started and the task does not block shutdown.
    #[error("task posted from {location} rejected: shutdown has started")]
    ShutdownStarted { location: Location },

    /// Shutdown completed, no task is accepted anymore.
    #[error("task posted from {location} rejected: shutdown is complete")]
    ShutdownComplete { location: Location },

    /// The scheduler owning the runner was joined or dropped.
    #[error("task rejected: the scheduler is gone")]
    SchedulerGone,
}

impl PostTaskError {
    pub fn location(&self) -> Option<Location> {
        match self {
            PostTaskError::ShutdownStarted { location }
            | PostTaskError::ShutdownComplete { location } => Some(*location),
            PostTaskError::SchedulerGone => None,
        }
    }
}

/// Failures during scheduler bring-up.
#[derive(thiserror::Error, Debug)]
pub enum SchedulerError {
    #[error("failed to spawn worker thread {name}: {source}")]
    WorkerSpawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn service thread: {0}")]
    ServiceThreadSpawn(#[source] io::Error),

    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),
}
