//! OS thread priority helpers.
//!
//! Priorities map onto Linux nice values, which are per-thread when set with
//! `who == 0`. Other platforms get no-op fallbacks and report every thread
//! as [`ThreadPriority::Normal`].

use anyhow::{Result, anyhow};

#[cfg(all(test, target_os = "linux"))]
use std::ffi::CStr;

#[cfg(all(test, target_os = "linux"))]
const MAX_PTHREAD_NAME_LEN: usize = 16;

/// Nice value applied to background threads.
const BACKGROUND_NICE: libc::c_int = 10;

/// Nice value applied to normal threads.
const NORMAL_NICE: libc::c_int = 0;

/// Scheduling priority of an OS thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ThreadPriority {
    /// Work that can be delayed without user-visible impact.
    Background,

    #[default]
    Normal,
}

impl ThreadPriority {
    fn nice_value(self) -> libc::c_int {
        match self {
            ThreadPriority::Background => BACKGROUND_NICE,
            ThreadPriority::Normal => NORMAL_NICE,
        }
    }

    fn from_nice_value(nice: libc::c_int) -> Self {
        if nice >= BACKGROUND_NICE {
            ThreadPriority::Background
        } else {
            ThreadPriority::Normal
        }
    }
}

/// Gets the OS name of the current thread. Linux truncates it to 15 bytes,
/// unlike the name `std::thread` keeps.
#[cfg(all(test, target_os = "linux"))]
pub(crate) fn get_current_thread_name() -> Result<String> {
    let mut c_name_buf: [libc::c_char; MAX_PTHREAD_NAME_LEN] = [0; MAX_PTHREAD_NAME_LEN];

    let ret = unsafe {
        libc::pthread_getname_np(
            libc::pthread_self(),
            c_name_buf.as_mut_ptr(),
            MAX_PTHREAD_NAME_LEN,
        )
    };

    if ret != 0 {
        return Err(anyhow!("pthread_getname_np failed with error code: {}", ret));
    }

    let c_str = unsafe { CStr::from_ptr(c_name_buf.as_ptr()) };
    c_str
        .to_str()
        .map(|s| s.to_string())
        .map_err(|e| anyhow!("Failed to convert thread name from CStr: {}", e))
}

#[cfg(all(test, not(target_os = "linux")))]
pub(crate) fn get_current_thread_name() -> Result<String> {
    std::thread::current()
        .name()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("current thread is unnamed"))
}

/// Applies `priority` to the calling thread only.
#[cfg(target_os = "linux")]
pub(crate) fn set_current_thread_priority(priority: ThreadPriority) -> Result<()> {
    let ret = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, priority.nice_value()) };

    if ret != 0 {
        return Err(anyhow!(
            "setpriority({:?}) failed: {}",
            priority,
            std::io::Error::last_os_error()
        ));
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn set_current_thread_priority(_priority: ThreadPriority) -> Result<()> {
    Ok(())
}

/// Reads back the priority of the calling thread from the OS.
#[cfg(target_os = "linux")]
pub fn current_thread_priority() -> ThreadPriority {
    // -1 is a valid nice value, so errno is the only error signal.
    let nice = unsafe {
        *libc::__errno_location() = 0;
        libc::getpriority(libc::PRIO_PROCESS, 0)
    };

    if nice == -1 && std::io::Error::last_os_error().raw_os_error() != Some(0) {
        return ThreadPriority::Normal;
    }

    ThreadPriority::from_nice_value(nice)
}

#[cfg(not(target_os = "linux"))]
pub fn current_thread_priority() -> ThreadPriority {
    ThreadPriority::Normal
}

/// Whether an unprivileged thread at [`ThreadPriority::Background`] may raise
/// itself back to [`ThreadPriority::Normal`].
///
/// Lowering priority is always allowed, raising it is bounded by
/// `RLIMIT_NICE` (ceiling is `20 - rlim_cur`). `CAP_SYS_NICE` is not probed,
/// so this can report `false` for a privileged process.
#[cfg(target_os = "linux")]
pub fn can_increase_current_thread_priority() -> bool {
    let mut rlimit = std::mem::MaybeUninit::<libc::rlimit>::uninit();
    let ret = unsafe { libc::getrlimit(libc::RLIMIT_NICE, rlimit.as_mut_ptr()) };

    if ret != 0 {
        return false;
    }

    let rlimit = unsafe { rlimit.assume_init() };
    let ceiling = 20 - rlimit.rlim_cur.min(40) as libc::c_int;
    ceiling <= NORMAL_NICE
}

#[cfg(not(target_os = "linux"))]
pub fn can_increase_current_thread_priority() -> bool {
    false
}
