//! The boot clock.
//!
//! Time in the core is a monotonic nanosecond count since [init] ran.
//! Suspendable operations take a relative timeout in nanoseconds: 0 means
//! "try without blocking", [DEADLINE_INFINITE](borealis_libkern::DEADLINE_INFINITE)
//! means "wait forever", anything else arms a deadline.

use std::time::{Duration, Instant};

use borealis_libkern::DEADLINE_INFINITE;
use crate::sync::Once;

/// The instant the kernel booted. Armed once by [init].
static BOOT_INSTANT: Once<Instant> = Once::new();

/// Arms the boot clock. Called from [crate::init].
pub fn init() {
    BOOT_INSTANT.call_once(Instant::now);
}

/// Nanoseconds elapsed since boot.
///
/// Reading the clock before [crate::init] arms it on the spot, so early
/// readers observe a time close to 0 rather than a crash.
pub fn current_time_ns() -> u64 {
    let boot = BOOT_INSTANT.call_once(Instant::now);
    let elapsed = boot.elapsed();
    elapsed.as_secs().saturating_mul(1_000_000_000)
        .saturating_add(u64::from(elapsed.subsec_nanos()))
}

/// Converts a relative nanosecond timeout to an absolute host deadline.
///
/// `None` means wait forever.
pub fn deadline_after(timeout_ns: u64) -> Option<Instant> {
    if timeout_ns == DEADLINE_INFINITE {
        None
    } else {
        // A timeout too large for the host clock is as good as forever.
        Instant::now().checked_add(Duration::from_nanos(timeout_ns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        crate::init();
        let a = current_time_ns();
        let b = current_time_ns();
        assert!(b >= a);
    }

    #[test]
    fn infinite_has_no_deadline() {
        assert!(deadline_after(DEADLINE_INFINITE).is_none());
        assert!(deadline_after(0).is_some());
    }
}
