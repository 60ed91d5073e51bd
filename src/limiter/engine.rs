//! The admission engine.
//!
//! Owns the policy set (an atomically-swapped immutable snapshot), the
//! shard array, the rotation epoch, and the metrics counters. All
//! operations are synchronous call-and-return; nothing here spawns
//! threads or timers. Rotation cadence is entirely the caller's.
//!
//! Concurrency is scoped at shard granularity: each shard is one
//! `parking_lot::Mutex`, so checks routed to different shards proceed in
//! parallel and no lock is ever held across I/O. `snapshot`/`restore`
//! are the only wide-lock operations: they take every shard lock to get
//! a consistent point-in-time image.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::clock;
use crate::config::FluxgateConfig;
use crate::error::{FluxgateError, Result};

use indexmap::IndexMap;

use super::gcra::{retry_after_ms, GcraState};
use super::key::KeyDeriver;
use super::metrics::Metrics;
use super::policy::PolicySet;
use super::request::{CheckDecision, CheckRequest, CheckResult};
use super::shard::{HotEntry, Shard};
use super::snapshot::{self, HotEntrySnapshot, ShardSnapshot, SnapshotDoc};

/// Engine parameters that are fixed at construction. Reload replaces
/// policies, never these.
#[derive(Debug, Clone, Copy)]
struct EngineParams {
    slices: u32,
    sketch_width: u32,
    sketch_depth: u32,
    admission_hits_to_promote: u32,
    shard_a_hot_capacity: u32,
    hot_idle_epochs: u64,
}

/// The request-admission engine.
pub struct Fluxgate {
    params: EngineParams,
    policies: ArcSwap<PolicySet>,
    // Serializes reload's read-bump-store of the policy version so
    // concurrent reloads cannot mint the same version twice.
    reload_lock: Mutex<()>,
    deriver: KeyDeriver,
    shards: Box<[Mutex<Shard>]>,
    epoch: AtomicU64,
    metrics: Metrics,
}

impl Fluxgate {
    /// Build an engine from a validated configuration.
    pub fn new(config: FluxgateConfig) -> Result<Self> {
        config.validate()?;
        let policy_set = PolicySet::compile(&config.policies, 1)?;

        let secret = match &config.key_secret {
            Some(secret) => secret.clone(),
            None => {
                // Unpredictable keys, but not stable across restarts;
                // snapshots only round-trip within one process then.
                let random: u128 = rand::thread_rng().gen();
                format!("fluxgate::{random:032x}")
            }
        };
        let deriver = KeyDeriver::new(&secret);

        let params = EngineParams {
            slices: config.slices,
            sketch_width: config.sketch_width,
            sketch_depth: config.sketch_depth,
            admission_hits_to_promote: config.admission_hits_to_promote,
            shard_a_hot_capacity: config.shard_a_hot_capacity,
            hot_idle_epochs: config.hot_idle_epochs,
        };

        let shards: Box<[Mutex<Shard>]> = (0..params.slices)
            .map(|_| Mutex::new(Self::blank_shard(&params, &deriver)))
            .collect();

        debug!(
            slices = params.slices,
            hot_capacity = params.shard_a_hot_capacity,
            sketch = %format_args!("{}x{}", params.sketch_depth, params.sketch_width),
            policies = config.policies.len(),
            "engine initialized"
        );

        Ok(Self {
            params,
            policies: ArcSwap::from_pointee(policy_set),
            reload_lock: Mutex::new(()),
            deriver,
            shards,
            epoch: AtomicU64::new(0),
            metrics: Metrics::default(),
        })
    }

    fn blank_shard(params: &EngineParams, deriver: &KeyDeriver) -> Shard {
        Shard::new(
            params.shard_a_hot_capacity,
            params.admission_hits_to_promote,
            params.sketch_width,
            params.sketch_depth,
            deriver.seed(),
        )
    }

    /// Evaluate one request against every matching policy at the current
    /// wall-clock time.
    pub fn check(&self, request: &CheckRequest) -> CheckResult {
        self.check_at(request, clock::now_us())
    }

    /// Evaluate one request at an explicit instant (microseconds since the
    /// Unix epoch). `check` delegates here; exposed so callers can replay
    /// recorded traffic deterministically.
    pub fn check_at(&self, request: &CheckRequest, now_us: u64) -> CheckResult {
        let set = self.policies.load();
        let epoch = self.epoch.load(Ordering::Relaxed);

        let mut decisions = IndexMap::new();
        let mut allowed = true;
        let mut retry_after: Option<u64> = None;

        for (policy, captured) in set.matching(request) {
            let key = self.deriver.derive(&policy.spec.id, &captured);
            let shard_idx = (key % self.shards.len() as u64) as usize;

            let check = self.shards[shard_idx].lock().check(
                key,
                &policy.spec.id,
                &policy.params,
                policy.spec.burst,
                now_us,
                epoch,
            );

            if check.promoted {
                self.metrics.record_promotion();
            }
            if check.evicted {
                self.metrics.record_eviction();
            }
            if check.estimate_deny_avoided {
                self.metrics.record_denial_avoided();
            }

            let decision = CheckDecision {
                allowed: check.allowed,
                retry_after_ms: check.retry_after_us.map(retry_after_ms),
            };

            if !check.allowed && policy.enforces() {
                allowed = false;
                retry_after = match (retry_after, decision.retry_after_ms) {
                    (Some(existing), Some(new)) => Some(existing.max(new)),
                    (None, new) => new,
                    (existing, None) => existing,
                };
            }

            trace!(
                policy = %policy.spec.id,
                key,
                shard = shard_idx,
                allowed = check.allowed,
                "policy decision"
            );
            decisions.insert(policy.spec.id.clone(), decision);
        }

        self.metrics.record_check(allowed);

        if allowed {
            CheckResult::allowed(decisions)
        } else {
            CheckResult::denied(retry_after, decisions)
        }
    }

    /// Evaluate a batch sequentially in input order. No atomicity across
    /// the batch: a later entry observes state mutated by an earlier one.
    pub fn check_batch(&self, requests: &[CheckRequest]) -> Vec<CheckResult> {
        let now_us = clock::now_us();
        requests
            .iter()
            .map(|request| self.check_at(request, now_us))
            .collect()
    }

    /// Advance one epoch: age every shard's sketch, sweep hot entries idle
    /// past the threshold or orphaned by a policy removal, and clear
    /// per-epoch promotion tallies. Safe to call on any cadence.
    pub fn rotate(&self) {
        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed) + 1;
        let set = self.policies.load();
        let live = set.ids();

        let mut swept = 0;
        let mut promoted = 0;
        for shard in self.shards.iter() {
            let mut guard = shard.lock();
            promoted += guard.epoch_promotions();
            swept += guard.rotate(epoch, self.params.hot_idle_epochs, &live);
        }
        self.metrics.record_rotation();
        debug!(epoch, swept, promoted, "rotation complete");
    }

    /// Atomically replace the active policy set. Shard state is retained:
    /// states for removed policy ids are reclaimed at the next rotation,
    /// and changed rate parameters are simply reinterpreted on next
    /// access. Topology and tier parameters are fixed at construction and
    /// ignored here.
    pub fn reload(&self, config: FluxgateConfig) -> Result<()> {
        config.validate()?;
        let _guard = self.reload_lock.lock();
        let version = self.policies.load().version() + 1;
        let set = PolicySet::compile(&config.policies, version)?;
        if config.slices != self.params.slices {
            debug!(
                configured = config.slices,
                active = self.params.slices,
                "reload does not change shard topology; slices ignored"
            );
        }
        self.policies.store(Arc::new(set));
        debug!(version, policies = config.policies.len(), "policies reloaded");
        Ok(())
    }

    /// Serialize the full engine state. Takes every shard lock for a
    /// consistent point-in-time image; expected to be infrequent.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let guards: Vec<_> = self.shards.iter().map(|shard| shard.lock()).collect();

        let shards = guards
            .iter()
            .map(|shard| {
                let (clock, hot, sketch_rows) = shard.export();
                ShardSnapshot {
                    clock,
                    hot: hot
                        .into_iter()
                        .map(|(key, entry)| HotEntrySnapshot {
                            key,
                            policy_id: entry.policy_id,
                            tat_us: entry.state.tat_us,
                            last_seen_epoch: entry.state.last_seen_epoch,
                            recency: entry.recency,
                        })
                        .collect(),
                    sketch_rows,
                }
            })
            .collect();

        let doc = SnapshotDoc {
            epoch: self.epoch.load(Ordering::Relaxed),
            policy_version: self.policies.load().version(),
            slices: self.params.slices,
            sketch_width: self.params.sketch_width,
            sketch_depth: self.params.sketch_depth,
            hot_capacity: self.params.shard_a_hot_capacity,
            shards,
        };
        snapshot::encode(&doc)
    }

    /// Replace the engine's state from a snapshot.
    ///
    /// The snapshot is decoded and rebuilt into complete replacement
    /// shards before any live state is touched; on any error the live
    /// engine is left exactly as it was. The active policy set is not
    /// part of the restored state.
    pub fn restore(&self, bytes: &[u8]) -> Result<()> {
        let doc = snapshot::decode(bytes)?;

        if doc.slices as usize != self.shards.len() {
            return Err(FluxgateError::Corruption(format!(
                "snapshot declares {} shards, engine has {}",
                doc.slices,
                self.shards.len()
            )));
        }
        if doc.shards.len() != doc.slices as usize {
            return Err(FluxgateError::Corruption(format!(
                "snapshot declares {} shards but carries {}",
                doc.slices,
                doc.shards.len()
            )));
        }
        if doc.sketch_width != self.params.sketch_width
            || doc.sketch_depth != self.params.sketch_depth
        {
            return Err(FluxgateError::Corruption(format!(
                "snapshot sketch is {}x{}, engine expects {}x{}",
                doc.sketch_depth, doc.sketch_width, self.params.sketch_depth, self.params.sketch_width
            )));
        }
        // An oversized hot tier would never shrink back under the bound:
        // eviction only runs once per promotion.
        if doc.hot_capacity != self.params.shard_a_hot_capacity {
            return Err(FluxgateError::Corruption(format!(
                "snapshot hot capacity is {}, engine expects {}",
                doc.hot_capacity, self.params.shard_a_hot_capacity
            )));
        }

        let mut replacements = Vec::with_capacity(doc.shards.len());
        for shard_snapshot in doc.shards {
            let mut shard = Self::blank_shard(&self.params, &self.deriver);
            let hot = shard_snapshot
                .hot
                .into_iter()
                .map(|entry| {
                    (
                        entry.key,
                        HotEntry {
                            policy_id: entry.policy_id,
                            state: GcraState {
                                tat_us: entry.tat_us,
                                last_seen_epoch: entry.last_seen_epoch,
                            },
                            recency: entry.recency,
                        },
                    )
                })
                .collect();
            if !shard.import(shard_snapshot.clock, hot, shard_snapshot.sketch_rows) {
                return Err(FluxgateError::Corruption(
                    "snapshot sketch rows do not match declared dimensions".to_string(),
                ));
            }
            replacements.push(shard);
        }

        // All replacement state is built; now swap wholesale under the
        // full set of shard locks.
        let mut guards: Vec<_> = self.shards.iter().map(|shard| shard.lock()).collect();
        for (guard, replacement) in guards.iter_mut().zip(replacements) {
            **guard = replacement;
        }
        self.epoch.store(doc.epoch, Ordering::Relaxed);
        debug!(
            epoch = doc.epoch,
            policy_version = doc.policy_version,
            "state restored from snapshot"
        );
        Ok(())
    }

    /// Point-in-time counter values aggregated across shards.
    pub fn metrics(&self) -> IndexMap<String, u64> {
        self.metrics.as_map(self.epoch.load(Ordering::Relaxed))
    }

    /// Engine build identifier, for compatibility checks by callers across
    /// snapshot boundaries.
    pub fn version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    /// Current rotation epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }

    /// Total exact entries across all shards. Test and introspection aid.
    pub fn hot_entries(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().hot_len()).sum()
    }
}
