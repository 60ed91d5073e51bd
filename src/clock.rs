//! Wall-clock source for the engine.
//!
//! All engine state is kept in integer microseconds since the Unix epoch.
//! The public `check` entry point reads this clock; `check_at` takes an
//! explicit instant so callers (and tests) can replay traffic
//! deterministically.

use std::time::{SystemTime, UNIX_EPOCH};

/// Microseconds per second.
pub const MICROS_PER_SEC: u64 = 1_000_000;

/// Current wall-clock time in microseconds since the Unix epoch.
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_monotonic_enough() {
        let t1 = now_us();
        let t2 = now_us();
        assert!(t2 >= t1);
    }
}
