//! Rate limiting engine: policy matching, two-tier per-key state, and
//! snapshot/restore.

mod engine;
mod gcra;
mod key;
mod metrics;
mod policy;
mod request;
mod shard;
mod sketch;
mod snapshot;

pub use engine::Fluxgate;
pub use gcra::{GcraOutcome, GcraState, RateParams};
pub use key::KeyDeriver;
pub use policy::{CompiledPolicy, PolicyMatcher, PolicySet};
pub use request::{CheckDecision, CheckRequest, CheckResult};
pub use sketch::FrequencySketch;
pub use snapshot::{FORMAT_VERSION as SNAPSHOT_FORMAT_VERSION, MAGIC as SNAPSHOT_MAGIC};
