//! Limiter key derivation.
//!
//! Keys are produced by a keyed hash (SipHash-1-3) seeded from the
//! configured secret, so identities cannot be predicted or crafted to
//! collide into a chosen shard or sketch bucket.

use indexmap::IndexMap;
use siphasher::sip::SipHasher13;
use std::hash::{Hash, Hasher};

/// Fixed keys used to stretch the configured secret into SipHash key
/// material. Arbitrary but stable constants.
const SEED_K0: (u64, u64) = (0x736f_6d65_7073_6575, 0x646f_7261_6e64_6f6d);
const SEED_K1: (u64, u64) = (0x6c79_6765_6e65_7261, 0x7465_6462_7974_6573);

/// Derives stable, collision-resistant limiter keys from a
/// `(policy, matched identity)` pair.
#[derive(Debug, Clone, Copy)]
pub struct KeyDeriver {
    k0: u64,
    k1: u64,
}

impl KeyDeriver {
    /// Build a deriver from the configured secret.
    pub fn new(secret: &str) -> Self {
        let mut hasher = SipHasher13::new_with_keys(SEED_K0.0, SEED_K0.1);
        secret.hash(&mut hasher);
        let k0 = hasher.finish();

        let mut hasher = SipHasher13::new_with_keys(SEED_K1.0, SEED_K1.1);
        secret.hash(&mut hasher);
        let k1 = hasher.finish();

        Self { k0, k1 }
    }

    /// Derive the limiter key for one policy and the identity values its
    /// match expression captured. Equal inputs always produce equal keys.
    pub fn derive(&self, policy_id: &str, captured: &IndexMap<String, String>) -> u64 {
        let mut hasher = SipHasher13::new_with_keys(self.k0, self.k1);
        policy_id.hash(&mut hasher);
        for (name, value) in captured {
            name.hash(&mut hasher);
            value.hash(&mut hasher);
        }
        hasher.finish()
    }

    /// SipHash key material, reused to seed the sketch row hashers so the
    /// whole engine's hashing is governed by one secret.
    pub fn seed(&self) -> (u64, u64) {
        (self.k0, self.k1)
    }
}
