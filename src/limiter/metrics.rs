//! Engine-wide counters.
//!
//! Plain atomic counters so the request path records without taking any
//! lock beyond its shard.

use indexmap::IndexMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregated counters across all shards.
#[derive(Debug, Default)]
pub struct Metrics {
    checks_total: AtomicU64,
    allowed_total: AtomicU64,
    denied_total: AtomicU64,
    promotions_total: AtomicU64,
    hot_evictions_total: AtomicU64,
    sketch_denials_avoided_total: AtomicU64,
    rotations_total: AtomicU64,
}

impl Metrics {
    /// Record one combined check outcome.
    pub fn record_check(&self, allowed: bool) {
        self.checks_total.fetch_add(1, Ordering::Relaxed);
        if allowed {
            self.allowed_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.denied_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_promotion(&self) {
        self.promotions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.hot_evictions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_denial_avoided(&self) {
        self.sketch_denials_avoided_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rotation(&self) {
        self.rotations_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time view of every counter, in a stable order.
    pub fn as_map(&self, epoch: u64) -> IndexMap<String, u64> {
        let mut map = IndexMap::new();
        map.insert(
            "checks_total".to_string(),
            self.checks_total.load(Ordering::Relaxed),
        );
        map.insert(
            "allowed_total".to_string(),
            self.allowed_total.load(Ordering::Relaxed),
        );
        map.insert(
            "denied_total".to_string(),
            self.denied_total.load(Ordering::Relaxed),
        );
        map.insert(
            "promotions_total".to_string(),
            self.promotions_total.load(Ordering::Relaxed),
        );
        map.insert(
            "hot_evictions_total".to_string(),
            self.hot_evictions_total.load(Ordering::Relaxed),
        );
        map.insert(
            "sketch_denials_avoided_total".to_string(),
            self.sketch_denials_avoided_total.load(Ordering::Relaxed),
        );
        map.insert(
            "rotations_total".to_string(),
            self.rotations_total.load(Ordering::Relaxed),
        );
        map.insert("epoch".to_string(), epoch);
        map
    }
}
