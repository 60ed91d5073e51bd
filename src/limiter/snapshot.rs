//! Snapshot codec.
//!
//! A snapshot is a framed bincode document: a 4-byte magic, a 1-byte
//! format version, then the serialized engine state. The frame lets
//! restore distinguish "not a snapshot / unknown format" from "snapshot
//! of the right format that does not decode or does not fit the engine".

use serde::{Deserialize, Serialize};

use crate::error::{FluxgateError, Result};

/// Magic bytes opening every snapshot.
pub const MAGIC: [u8; 4] = *b"FXGS";

/// Current snapshot format version.
pub const FORMAT_VERSION: u8 = 1;

/// The full serialized engine state.
#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotDoc {
    /// Rotation epoch at capture time.
    pub epoch: u64,
    /// Version marker of the policy set active at capture time. Recorded
    /// for callers; restore does not require it to match the live set.
    pub policy_version: u64,
    /// Shard count the snapshot was taken with; must match the engine it
    /// is restored into.
    pub slices: u32,
    pub sketch_width: u32,
    pub sketch_depth: u32,
    /// Hot-tier capacity the snapshot was taken with; must match the
    /// engine it is restored into, or a restored shard could carry more
    /// exact entries than the capacity bound allows.
    pub hot_capacity: u32,
    /// Per-shard state, in shard index order.
    pub shards: Vec<ShardSnapshot>,
}

/// One shard's serialized state.
#[derive(Debug, Serialize, Deserialize)]
pub struct ShardSnapshot {
    /// The shard's recency clock.
    pub clock: u64,
    /// Hot-tier entries: key, owning policy id, GCRA state, recency.
    pub hot: Vec<HotEntrySnapshot>,
    /// Sketch counter grid, row-major.
    pub sketch_rows: Vec<Vec<u32>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HotEntrySnapshot {
    pub key: u64,
    pub policy_id: String,
    pub tat_us: u64,
    pub last_seen_epoch: u64,
    pub recency: u64,
}

/// Serialize a snapshot document into its framed byte form.
pub fn encode(doc: &SnapshotDoc) -> Result<Vec<u8>> {
    let payload = bincode::serialize(doc)
        .map_err(|err| FluxgateError::Internal(format!("snapshot encode failed: {err}")))?;
    let mut bytes = Vec::with_capacity(MAGIC.len() + 1 + payload.len());
    bytes.extend_from_slice(&MAGIC);
    bytes.push(FORMAT_VERSION);
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Parse a framed snapshot. Unrecognized magic or version is a `Format`
/// error; a payload that fails to decode is a `Corruption` error.
pub fn decode(bytes: &[u8]) -> Result<SnapshotDoc> {
    if bytes.len() < MAGIC.len() + 1 {
        return Err(FluxgateError::Format(
            "snapshot shorter than its header".to_string(),
        ));
    }
    if bytes[..MAGIC.len()] != MAGIC {
        return Err(FluxgateError::Format(
            "unrecognized snapshot magic".to_string(),
        ));
    }
    let version = bytes[MAGIC.len()];
    if version != FORMAT_VERSION {
        return Err(FluxgateError::Format(format!(
            "unsupported snapshot format version {version}"
        )));
    }
    bincode::deserialize(&bytes[MAGIC.len() + 1..])
        .map_err(|err| FluxgateError::Corruption(format!("snapshot payload: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> SnapshotDoc {
        SnapshotDoc {
            epoch: 3,
            policy_version: 2,
            slices: 1,
            sketch_width: 8,
            sketch_depth: 2,
            hot_capacity: 16,
            shards: vec![ShardSnapshot {
                clock: 5,
                hot: vec![HotEntrySnapshot {
                    key: 99,
                    policy_id: "p".to_string(),
                    tat_us: 1_000,
                    last_seen_epoch: 3,
                    recency: 5,
                }],
                sketch_rows: vec![vec![0; 8]; 2],
            }],
        }
    }

    #[test]
    fn test_round_trip() {
        let bytes = encode(&doc()).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.epoch, 3);
        assert_eq!(decoded.shards.len(), 1);
        assert_eq!(decoded.shards[0].hot[0].key, 99);
    }

    #[test]
    fn test_bad_magic_is_format_error() {
        let mut bytes = encode(&doc()).unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            decode(&bytes),
            Err(FluxgateError::Format(_))
        ));
    }

    #[test]
    fn test_unknown_version_is_format_error() {
        let mut bytes = encode(&doc()).unwrap();
        bytes[4] = 200;
        assert!(matches!(
            decode(&bytes),
            Err(FluxgateError::Format(_))
        ));
    }

    #[test]
    fn test_truncated_payload_is_corruption_error() {
        let bytes = encode(&doc()).unwrap();
        let truncated = &bytes[..bytes.len() - 3];
        assert!(matches!(
            decode(truncated),
            Err(FluxgateError::Corruption(_))
        ));
    }

    #[test]
    fn test_empty_input_is_format_error() {
        assert!(matches!(decode(&[]), Err(FluxgateError::Format(_))));
    }
}
