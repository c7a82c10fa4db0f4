pub(crate) mod event;
pub(crate) use event::WaitableEvent;

pub(crate) mod scope_guard;
pub(crate) use scope_guard::ScopeGuard;

pub mod thread;
pub use thread::ThreadPriority;

pub(crate) mod time;
