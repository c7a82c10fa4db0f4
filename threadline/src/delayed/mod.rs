mod service_thread;
pub(crate) use service_thread::ServiceThread;

mod manager;
pub(crate) use manager::DelayedTaskManager;
