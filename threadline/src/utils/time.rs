use std::time::{Duration, Instant};

/// Thirty years, far enough that a deadline this late is never reached.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `from + delay`, saturated to a deadline in the far future instead of
/// overflowing `Instant`.
pub(crate) fn deadline_after(from: Instant, delay: Duration) -> Instant {
    from.checked_add(delay)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}
