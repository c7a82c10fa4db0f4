use std::sync::atomic::{AtomicU64, Ordering};
use std::{fmt, num::NonZeroU64};

/// Defines a process-wide monotonic identifier backed by its own counter.
macro_rules! define_id {
    ($(#[$meta:meta])* $vis:vis struct $name:ident, $what:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
        $vis struct $name(NonZeroU64);

        impl $name {
            pub(crate) fn next() -> Self {
                static COUNTER: AtomicU64 = AtomicU64::new(1);

                let id = COUNTER.fetch_add(1, Ordering::Relaxed);
                let Some(id) = NonZeroU64::new(id) else {
                    exhausted($what);
                };

                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

define_id!(
    /// Identifies a [`Sequence`](crate::sequence::Sequence) for its whole
    /// lifetime. Tokens are never reused.
    pub struct SequenceToken,
    "sequence token"
);

define_id!(pub(crate) struct PoolId, "pool ID");

define_id!(pub(crate) struct WorkerId, "worker ID");

impl SequenceToken {
    pub fn as_u64(&self) -> u64 {
        self.0.get()
    }
}

#[cold]
fn exhausted(what: &str) -> ! {
    panic!("failed to generate unique {what}: bitspace exhausted")
}
