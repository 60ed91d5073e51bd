//! Per-shard state: the exact hot tier and the approximate cold tier.
//!
//! Each shard owns a capacity-bounded map of key → exact GCRA state plus
//! one frequency sketch for everything not (yet) in that map. New keys
//! start cold and are only sketch-tracked; once a key's estimated count
//! reaches the admission threshold it is promoted to an exact entry,
//! evicting the least-recently-used entry when the tier is full. This
//! bounds per-shard memory regardless of how many distinct identities
//! show up.

use std::collections::{HashMap, HashSet};
use tracing::{debug, trace};

use super::gcra::{GcraOutcome, GcraState, RateParams};
use super::sketch::FrequencySketch;

/// An exact hot-tier entry.
#[derive(Debug, Clone)]
pub struct HotEntry {
    /// Id of the policy this key was derived under, kept so the rotation
    /// sweep can reclaim states orphaned by a reload.
    pub policy_id: String,
    /// Exact GCRA state, owned exclusively by this entry.
    pub state: GcraState,
    /// Recency marker from the shard's access clock; the smallest marker
    /// is the LRU eviction victim.
    pub recency: u64,
}

/// What one shard-level check did, so the engine can aggregate metrics
/// and build the per-policy decision.
#[derive(Debug, Clone, Copy)]
pub struct ShardCheck {
    /// Whether the request was admitted.
    pub allowed: bool,
    /// Wait until conformance, in microseconds. Present only on a deny.
    pub retry_after_us: Option<u64>,
    /// A cold key crossed the admission threshold and gained an exact entry.
    pub promoted: bool,
    /// Promotion evicted the least-recently-used entry.
    pub evicted: bool,
    /// A cold key was optimistically allowed although its estimate already
    /// exceeded the policy burst — the deny exact accounting might have
    /// issued was avoided.
    pub estimate_deny_avoided: bool,
}

/// One partition of the key space: hot tier + sketch + admission state.
#[derive(Debug)]
pub struct Shard {
    hot: HashMap<u64, HotEntry>,
    sketch: FrequencySketch,
    /// Monotonic access clock feeding recency markers.
    clock: u64,
    hot_capacity: usize,
    promote_after: u32,
    /// Promotions in the current epoch; rotation clears it.
    epoch_promotions: u64,
}

impl Shard {
    pub fn new(
        hot_capacity: u32,
        promote_after: u32,
        sketch_width: u32,
        sketch_depth: u32,
        seed: (u64, u64),
    ) -> Self {
        Self {
            hot: HashMap::with_capacity(hot_capacity as usize),
            sketch: FrequencySketch::new(sketch_width, sketch_depth, seed),
            clock: 0,
            hot_capacity: hot_capacity as usize,
            promote_after,
            epoch_promotions: 0,
        }
    }

    /// Evaluate one request for one key under the given policy parameters.
    pub fn check(
        &mut self,
        key: u64,
        policy_id: &str,
        params: &RateParams,
        burst: u32,
        now_us: u64,
        epoch: u64,
    ) -> ShardCheck {
        self.clock += 1;
        let recency = self.clock;

        if let Some(entry) = self.hot.get_mut(&key) {
            entry.recency = recency;
            return match entry.state.consume(params, now_us, epoch) {
                GcraOutcome::Allowed => ShardCheck::allowed(),
                GcraOutcome::Denied { retry_after_us } => ShardCheck::denied(retry_after_us),
            };
        }

        // Cold tier: the sketch only gates promotion, it never denies.
        let estimate = self.sketch.record(key);
        if estimate >= self.promote_after {
            let evicted = self.make_room();
            // Promotion seeds a fresh state: no back-dated history, so the
            // promoting request itself is always admitted.
            let mut state = GcraState::fresh(now_us, epoch);
            let outcome = state.consume(params, now_us, epoch);
            debug_assert!(matches!(outcome, GcraOutcome::Allowed));
            self.hot.insert(
                key,
                HotEntry {
                    policy_id: policy_id.to_string(),
                    state,
                    recency,
                },
            );
            self.epoch_promotions += 1;
            trace!(key, policy = policy_id, estimate, "promoted key to hot tier");
            return ShardCheck {
                promoted: true,
                evicted,
                ..ShardCheck::allowed()
            };
        }

        ShardCheck {
            estimate_deny_avoided: estimate > burst,
            ..ShardCheck::allowed()
        }
    }

    /// Evict the LRU entry if the hot tier is at capacity. The evicted
    /// exact state is discarded, not merged back into the sketch; the key
    /// reverts to cold-tier behavior from a fresh baseline.
    fn make_room(&mut self) -> bool {
        if self.hot.len() < self.hot_capacity {
            return false;
        }
        let victim = self
            .hot
            .iter()
            .min_by_key(|(_, entry)| entry.recency)
            .map(|(key, _)| *key);
        if let Some(key) = victim {
            self.hot.remove(&key);
            trace!(key, "evicted least-recently-used hot entry");
        }
        true
    }

    /// Apply one rotation to this shard: age the sketch, sweep hot entries
    /// that sat idle past the threshold or reference a removed policy, and
    /// clear the per-epoch promotion tally. Returns the number of entries
    /// swept.
    pub fn rotate(&mut self, epoch: u64, idle_epochs: u64, live_policies: &HashSet<&str>) -> usize {
        self.sketch.halve();
        let before = self.hot.len();
        self.hot.retain(|_, entry| {
            live_policies.contains(entry.policy_id.as_str())
                && epoch.saturating_sub(entry.state.last_seen_epoch) <= idle_epochs
        });
        let swept = before - self.hot.len();
        if swept > 0 {
            debug!(swept, epoch, "rotation sweep reclaimed hot entries");
        }
        self.epoch_promotions = 0;
        swept
    }

    /// Number of exact entries currently held.
    pub fn hot_len(&self) -> usize {
        self.hot.len()
    }

    /// Promotions observed in the current epoch.
    pub fn epoch_promotions(&self) -> u64 {
        self.epoch_promotions
    }

    /// Snapshot accessors.
    pub fn export(&self) -> (u64, Vec<(u64, HotEntry)>, Vec<Vec<u32>>) {
        let mut hot: Vec<(u64, HotEntry)> =
            self.hot.iter().map(|(k, e)| (*k, e.clone())).collect();
        // Deterministic order so identical states produce identical bytes.
        hot.sort_by_key(|(k, _)| *k);
        (self.clock, hot, self.sketch.rows().to_vec())
    }

    /// Replace this shard's state from a snapshot. Returns `false` when
    /// the sketch grid dimensions do not match this shard's configuration.
    pub fn import(&mut self, clock: u64, hot: Vec<(u64, HotEntry)>, rows: Vec<Vec<u32>>) -> bool {
        if !self.sketch.restore_rows(rows) {
            return false;
        }
        self.clock = clock;
        self.hot = hot.into_iter().collect();
        true
    }
}

impl ShardCheck {
    fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after_us: None,
            promoted: false,
            evicted: false,
            estimate_deny_avoided: false,
        }
    }

    fn denied(retry_after_us: u64) -> Self {
        Self {
            allowed: false,
            retry_after_us: Some(retry_after_us),
            promoted: false,
            evicted: false,
            estimate_deny_avoided: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(capacity: u32, promote_after: u32) -> Shard {
        Shard::new(capacity, promote_after, 64, 4, (0xabc, 0xdef))
    }

    fn params() -> RateParams {
        RateParams::new(100, 2)
    }

    fn live(ids: &[&'static str]) -> HashSet<&'static str> {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_cold_key_allowed_optimistically() {
        let mut shard = shard(4, 100);
        // Far over the exact burst, but never promoted: every check allows.
        for _ in 0..50 {
            let check = shard.check(1, "p", &params(), 2, 0, 0);
            assert!(check.allowed);
            assert!(!check.promoted);
        }
        assert_eq!(shard.hot_len(), 0);
    }

    #[test]
    fn test_cold_over_burst_counts_avoided_denials() {
        let mut shard = shard(4, 100);
        let mut avoided = 0;
        for _ in 0..10 {
            if shard.check(1, "p", &params(), 2, 0, 0).estimate_deny_avoided {
                avoided += 1;
            }
        }
        // Burst is 2, so from the 3rd cold hit on the estimate exceeds it.
        assert_eq!(avoided, 8);
    }

    #[test]
    fn test_promotion_after_threshold() {
        let mut shard = shard(4, 3);
        assert!(!shard.check(1, "p", &params(), 2, 0, 0).promoted);
        assert!(!shard.check(1, "p", &params(), 2, 0, 0).promoted);
        let third = shard.check(1, "p", &params(), 2, 0, 0);
        assert!(third.promoted);
        assert!(third.allowed);
        assert_eq!(shard.hot_len(), 1);
        assert_eq!(shard.epoch_promotions(), 1);
    }

    #[test]
    fn test_post_promotion_uses_exact_accounting() {
        let mut shard = shard(4, 1);
        // First hit promotes (threshold 1) and consumes one of burst 2.
        assert!(shard.check(1, "p", &params(), 2, 0, 0).promoted);
        assert!(shard.check(1, "p", &params(), 2, 0, 0).allowed);
        let third = shard.check(1, "p", &params(), 2, 0, 0);
        assert!(!third.allowed);
        assert_eq!(third.retry_after_us, Some(10_000));
    }

    #[test]
    fn test_capacity_bound_and_lru_eviction() {
        let mut shard = shard(2, 1);
        shard.check(1, "p", &params(), 2, 0, 0);
        shard.check(2, "p", &params(), 2, 0, 0);
        assert_eq!(shard.hot_len(), 2);

        // Touch key 1 so key 2 is the LRU victim.
        shard.check(1, "p", &params(), 2, 0, 0);
        let check = shard.check(3, "p", &params(), 2, 0, 0);
        assert!(check.promoted);
        assert!(check.evicted);
        assert_eq!(shard.hot_len(), 2);

        // Key 2 reverted to cold: its next check re-promotes from fresh.
        let back = shard.check(2, "p", &params(), 2, 0, 0);
        assert!(back.promoted);
    }

    #[test]
    fn test_rotation_sweeps_idle_entries() {
        let mut shard = shard(8, 1);
        shard.check(1, "p", &params(), 2, 0, 0); // last seen epoch 0
        assert_eq!(shard.rotate(1, 2, &live(&["p"])), 0);
        assert_eq!(shard.rotate(2, 2, &live(&["p"])), 0);
        // Epoch 3 puts the entry past the idle threshold of 2.
        assert_eq!(shard.rotate(3, 2, &live(&["p"])), 1);
        assert_eq!(shard.hot_len(), 0);
    }

    #[test]
    fn test_rotation_reclaims_orphaned_policies() {
        let mut shard = shard(8, 1);
        shard.check(1, "removed", &params(), 2, 0, 0);
        shard.check(2, "kept", &params(), 2, 0, 0);
        assert_eq!(shard.rotate(1, 5, &live(&["kept"])), 1);
        assert_eq!(shard.hot_len(), 1);
    }

    #[test]
    fn test_rotation_resets_promotion_tally() {
        let mut shard = shard(8, 1);
        shard.check(1, "p", &params(), 2, 0, 0);
        assert_eq!(shard.epoch_promotions(), 1);
        shard.rotate(1, 2, &live(&["p"]));
        assert_eq!(shard.epoch_promotions(), 0);
    }

    #[test]
    fn test_export_import_round_trip() {
        let mut shard = shard(8, 1);
        shard.check(1, "p", &params(), 2, 0, 0);
        shard.check(1, "p", &params(), 2, 0, 0);
        let (clock, hot, rows) = shard.export();

        let mut fresh = Shard::new(8, 1, 64, 4, (0xabc, 0xdef));
        assert!(fresh.import(clock, hot, rows));
        assert_eq!(fresh.hot_len(), 1);

        // Both shards produce the same decision stream from here on.
        let a = shard.check(1, "p", &params(), 2, 0, 0);
        let b = fresh.check(1, "p", &params(), 2, 0, 0);
        assert_eq!(a.allowed, b.allowed);
        assert_eq!(a.retry_after_us, b.retry_after_us);
    }

    #[test]
    fn test_import_rejects_wrong_sketch_shape() {
        let mut shard = shard(8, 1);
        assert!(!shard.import(0, Vec::new(), vec![vec![0; 32]; 4]));
    }
}
