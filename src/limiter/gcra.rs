//! GCRA (Generic Cell Rate Algorithm) virtual-scheduling state.
//!
//! GCRA enforces an average rate with explicit burst tolerance from a
//! single theoretical-arrival-time (TAT) value per key. The TAT tracks
//! how far ahead of the wall clock a key's traffic has run; a request is
//! admitted while the TAT stays within the burst allowance of `now`.

use serde::{Deserialize, Serialize};

use crate::clock::MICROS_PER_SEC;

/// Rate parameters of a policy, reduced to the two GCRA constants.
///
/// Derived once per policy at compile time so the per-request path does
/// no division.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateParams {
    /// Emission interval `T` in microseconds: the virtual-time cost of one
    /// admitted request (`1 / ratePerSecond`).
    pub emission_interval_us: u64,

    /// Burst allowance in microseconds: how far the TAT may run ahead of
    /// `now` before requests are denied. Sized so that a burst of exactly
    /// `burst` requests from a fresh key is admitted instantaneously and
    /// the next request waits one emission interval.
    pub burst_allowance_us: u64,
}

impl RateParams {
    /// Derive GCRA constants from a policy's rate and burst.
    ///
    /// `rate_per_second` and `burst` must already be validated positive.
    pub fn new(rate_per_second: u32, burst: u32) -> Self {
        let emission_interval_us =
            ((MICROS_PER_SEC as f64 / rate_per_second as f64).round() as u64).max(1);
        // The allowance excludes the emission the current request itself
        // consumes, so a fresh key admits exactly `burst` requests at one
        // instant.
        let burst_allowance_us = emission_interval_us.saturating_mul(burst.saturating_sub(1) as u64);
        Self {
            emission_interval_us,
            burst_allowance_us,
        }
    }
}

/// Exact per-key limiter state: the virtual scheduler's TAT plus the
/// epoch the key was last seen in (for the rotation sweep).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcraState {
    /// Theoretical arrival time in microseconds since the Unix epoch.
    pub tat_us: u64,

    /// Rotation epoch of the last access.
    pub last_seen_epoch: u64,
}

/// Outcome of consuming one request against a key's GCRA state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcraOutcome {
    /// Request admitted; the TAT advanced by one emission interval.
    Allowed,
    /// Request denied; admissible again after `retry_after_us`.
    Denied {
        /// Time until the key conforms again, in microseconds.
        retry_after_us: u64,
    },
}

impl GcraState {
    /// State for a key seen for the first time (or promoted with no
    /// back-dated history): the TAT starts at the wall clock.
    pub fn fresh(now_us: u64, epoch: u64) -> Self {
        Self {
            tat_us: now_us,
            last_seen_epoch: epoch,
        }
    }

    /// Evaluate one arrival at `now_us` and advance the state if admitted.
    pub fn consume(&mut self, params: &RateParams, now_us: u64, epoch: u64) -> GcraOutcome {
        self.last_seen_epoch = epoch;

        let allow_at = self.tat_us.saturating_sub(params.burst_allowance_us);
        if now_us >= allow_at {
            self.tat_us = self.tat_us.max(now_us) + params.emission_interval_us;
            GcraOutcome::Allowed
        } else {
            GcraOutcome::Denied {
                retry_after_us: allow_at - now_us,
            }
        }
    }
}

/// Convert a microsecond wait into the milliseconds reported to callers,
/// rounding up so the caller never retries early.
pub fn retry_after_ms(retry_after_us: u64) -> u64 {
    retry_after_us.div_ceil(1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(rate: u32, burst: u32) -> RateParams {
        RateParams::new(rate, burst)
    }

    #[test]
    fn test_emission_interval_derivation() {
        assert_eq!(params(100, 1).emission_interval_us, 10_000);
        assert_eq!(params(1, 1).emission_interval_us, 1_000_000);
        // Rates above 1M rps clamp to the microsecond tick.
        assert_eq!(params(2_000_000, 1).emission_interval_us, 1);
    }

    #[test]
    fn test_burst_fully_admitted_then_denied() {
        // Concrete scenario: 100 rps, burst 50. 50 requests at t=0 are all
        // allowed, the 51st is denied with a ~10ms wait, and it conforms
        // again at t=10ms.
        let p = params(100, 50);
        let mut state = GcraState::fresh(0, 0);

        for _ in 0..50 {
            assert_eq!(state.consume(&p, 0, 0), GcraOutcome::Allowed);
        }

        match state.consume(&p, 0, 0) {
            GcraOutcome::Denied { retry_after_us } => {
                assert_eq!(retry_after_ms(retry_after_us), 10);
            }
            GcraOutcome::Allowed => panic!("burst + 1 must be denied"),
        }

        assert_eq!(state.consume(&p, 10_000, 0), GcraOutcome::Allowed);
    }

    #[test]
    fn test_conforming_rate_always_allowed() {
        // One request per emission interval never accumulates debt.
        let p = params(100, 1);
        let mut state = GcraState::fresh(0, 0);
        for i in 0..1_000u64 {
            let now = i * p.emission_interval_us;
            assert_eq!(state.consume(&p, now, 0), GcraOutcome::Allowed);
        }
    }

    #[test]
    fn test_retry_shrinks_as_time_passes() {
        let p = params(10, 1); // T = 100ms
        let mut state = GcraState::fresh(0, 0);
        assert_eq!(state.consume(&p, 0, 0), GcraOutcome::Allowed);

        let denied_at_20 = state.consume(&p, 20_000, 0);
        assert_eq!(
            denied_at_20,
            GcraOutcome::Denied {
                retry_after_us: 80_000
            }
        );
        let denied_at_60 = state.consume(&p, 60_000, 0);
        assert_eq!(
            denied_at_60,
            GcraOutcome::Denied {
                retry_after_us: 40_000
            }
        );
    }

    #[test]
    fn test_idle_key_does_not_bank_unbounded_credit() {
        // After a long idle gap the key still only gets `burst` requests
        // at once: the TAT is clamped up to `now` on the first allow.
        let p = params(100, 2);
        let mut state = GcraState::fresh(0, 0);
        assert_eq!(state.consume(&p, 0, 0), GcraOutcome::Allowed);

        let later = 3_600 * MICROS_PER_SEC;
        assert_eq!(state.consume(&p, later, 0), GcraOutcome::Allowed);
        assert_eq!(state.consume(&p, later, 0), GcraOutcome::Allowed);
        assert!(matches!(
            state.consume(&p, later, 0),
            GcraOutcome::Denied { .. }
        ));
    }

    #[test]
    fn test_consume_updates_last_seen_epoch() {
        let p = params(100, 1);
        let mut state = GcraState::fresh(0, 3);
        state.consume(&p, 0, 7);
        assert_eq!(state.last_seen_epoch, 7);
    }

    #[test]
    fn test_retry_after_ms_rounds_up() {
        assert_eq!(retry_after_ms(0), 0);
        assert_eq!(retry_after_ms(1), 1);
        assert_eq!(retry_after_ms(1_000), 1);
        assert_eq!(retry_after_ms(1_001), 2);
    }
}
