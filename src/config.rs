//! Configuration management for the Fluxgate engine.

use serde::{Deserialize, Serialize};

use crate::error::{FluxgateError, Result};

/// Main configuration for a Fluxgate engine.
///
/// Numeric parameters have working defaults; only the policy list is
/// mandatory. All numeric parameters must be positive — validation runs
/// before the configuration takes effect, so a rejected configuration
/// never disturbs a live engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FluxgateConfig {
    /// Rate policies, evaluated most-specific first against each request.
    pub policies: Vec<PolicySpec>,

    /// Secret seed for keyed hashing of limiter keys. Generated randomly
    /// when absent, which makes keys unpredictable but not stable across
    /// process restarts.
    #[serde(default)]
    pub key_secret: Option<String>,

    /// Number of independent shards the key space is partitioned into.
    /// Fixed at construction; reload replaces policies, not topology.
    #[serde(default = "default_slices")]
    pub slices: u32,

    /// Columns per row of the cold-tier frequency sketch.
    #[serde(default = "default_sketch_width")]
    pub sketch_width: u32,

    /// Independent hash rows of the cold-tier frequency sketch.
    #[serde(default = "default_sketch_depth")]
    pub sketch_depth: u32,

    /// Estimated hits within the current epoch at which a cold key is
    /// promoted to exact hot-tier accounting.
    #[serde(default = "default_admission_hits")]
    pub admission_hits_to_promote: u32,

    /// Maximum exact entries per shard; promotion beyond this evicts the
    /// least-recently-used entry.
    #[serde(default = "default_hot_capacity")]
    pub shard_a_hot_capacity: u32,

    /// Number of rotations a hot entry may sit idle before the rotation
    /// sweep reclaims it.
    #[serde(default = "default_hot_idle_epochs")]
    pub hot_idle_epochs: u64,
}

/// A single rate policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    /// Unique identifier, referenced by per-policy decisions and keyed state.
    pub id: String,

    /// Match expression over request attributes, e.g. `"ip:* route:/api/*"`.
    #[serde(rename = "match")]
    pub match_rule: String,

    /// Sustained rate in requests per second.
    pub rate_per_second: u32,

    /// Burst tolerance in requests.
    pub burst: u32,

    /// Averaging window in seconds. Informational for GCRA (the emission
    /// interval depends only on the rate) but validated for sanity.
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u32,

    /// What a deny from this policy does to the overall outcome.
    #[serde(default)]
    pub action: PolicyAction,
}

/// Effect of a policy's decision on the combined outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    /// A deny from this policy denies the request.
    #[default]
    Reject,
    /// Decision is reported in `per_policy_decisions` but never blocks
    /// the overall outcome. Used for observability-only rules.
    Annotate,
}

fn default_slices() -> u32 {
    8
}

fn default_sketch_width() -> u32 {
    1024
}

fn default_sketch_depth() -> u32 {
    4
}

fn default_admission_hits() -> u32 {
    8
}

fn default_hot_capacity() -> u32 {
    1024
}

fn default_hot_idle_epochs() -> u64 {
    2
}

fn default_window_seconds() -> u32 {
    60
}

impl FluxgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: FluxgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| FluxgateError::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate numeric parameters and policy shape.
    ///
    /// Match expressions are compiled (and therefore validated) separately
    /// when the policy set is built.
    pub fn validate(&self) -> Result<()> {
        if self.policies.is_empty() {
            return Err(FluxgateError::Config(
                "at least one policy must be provided".to_string(),
            ));
        }
        if self.slices == 0 {
            return Err(FluxgateError::Config("slices must be positive".to_string()));
        }
        if self.sketch_width == 0 || self.sketch_depth == 0 {
            return Err(FluxgateError::Config(
                "sketch dimensions must be positive".to_string(),
            ));
        }
        if self.admission_hits_to_promote == 0 {
            return Err(FluxgateError::Config(
                "admissionHitsToPromote must be positive".to_string(),
            ));
        }
        if self.shard_a_hot_capacity == 0 {
            return Err(FluxgateError::Config(
                "shardAHotCapacity must be positive".to_string(),
            ));
        }
        if self.hot_idle_epochs == 0 {
            return Err(FluxgateError::Config(
                "hotIdleEpochs must be positive".to_string(),
            ));
        }

        let mut seen_ids = std::collections::HashSet::new();
        for policy in &self.policies {
            if policy.id.is_empty() {
                return Err(FluxgateError::Config(
                    "policy id must not be empty".to_string(),
                ));
            }
            if !seen_ids.insert(policy.id.as_str()) {
                return Err(FluxgateError::Config(format!(
                    "duplicate policy id: {}",
                    policy.id
                )));
            }
            if policy.rate_per_second == 0 {
                return Err(FluxgateError::Config(format!(
                    "policy {}: ratePerSecond must be positive",
                    policy.id
                )));
            }
            if policy.burst == 0 {
                return Err(FluxgateError::Config(format!(
                    "policy {}: burst must be at least 1",
                    policy.id
                )));
            }
            if policy.window_seconds == 0 {
                return Err(FluxgateError::Config(format!(
                    "policy {}: windowSeconds must be positive",
                    policy.id
                )));
            }
        }

        Ok(())
    }
}
