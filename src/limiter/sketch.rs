//! Cold-tier frequency sketch.
//!
//! A count-min sketch: a fixed grid of counters (rows = independent hash
//! functions, columns = buckets). It serves as a frequency table of
//! events — the estimate may overcount because of collisions, never
//! undercount. Increments use the conservative-update rule to cut the
//! overcount further, and rotation halves every counter so the grid
//! weights recent traffic without ever growing.
//!
//! The sketch never enforces limits itself; it only gates promotion into
//! the exact hot tier.

use siphasher::sip::SipHasher13;
use std::hash::Hasher;

/// Bounded approximate counters for the long tail of keys.
#[derive(Debug, Clone)]
pub struct FrequencySketch {
    width: usize,
    rows: Vec<Vec<u32>>,
    /// Per-row SipHash keys, derived from the engine secret so bucket
    /// placement is not predictable from outside.
    seeds: Vec<(u64, u64)>,
}

impl FrequencySketch {
    /// Create an all-zero sketch. `width`/`depth` are configuration-fixed;
    /// larger values trade memory for less collision-induced overcounting.
    pub fn new(width: u32, depth: u32, seed: (u64, u64)) -> Self {
        let width = width as usize;
        let depth = depth as usize;
        let seeds = (0..depth as u64)
            .map(|row| {
                (
                    seed.0 ^ (0x9e37_79b9_7f4a_7c15u64.wrapping_mul(row + 1)),
                    seed.1.rotate_left((row as u32 % 63) + 1),
                )
            })
            .collect();
        Self {
            width,
            rows: vec![vec![0u32; width]; depth],
            seeds,
        }
    }

    fn bucket(&self, row: usize, key: u64) -> usize {
        let (k0, k1) = self.seeds[row];
        let mut hasher = SipHasher13::new_with_keys(k0, k1);
        hasher.write_u64(key);
        (hasher.finish() % self.width as u64) as usize
    }

    /// Current estimate for a key: the minimum counter across rows.
    pub fn estimate(&self, key: u64) -> u32 {
        (0..self.rows.len())
            .map(|row| self.rows[row][self.bucket(row, key)])
            .min()
            .unwrap_or(0)
    }

    /// Record one observation of a key and return the new estimate.
    ///
    /// Conservative update: only the counters currently holding the
    /// minimum are incremented, so a colliding heavy key inflates a light
    /// key's estimate as little as possible. Counters saturate instead of
    /// overflowing.
    pub fn record(&mut self, key: u64) -> u32 {
        let buckets: Vec<usize> = (0..self.rows.len())
            .map(|row| self.bucket(row, key))
            .collect();
        let min = buckets
            .iter()
            .enumerate()
            .map(|(row, &b)| self.rows[row][b])
            .min()
            .unwrap_or(0);
        for (row, &b) in buckets.iter().enumerate() {
            let counter = &mut self.rows[row][b];
            if *counter == min {
                *counter = counter.saturating_add(1);
            }
        }
        min.saturating_add(1)
    }

    /// Age the grid: halve every counter. Preserves recent-trend weighting
    /// across epoch boundaries while bounding growth.
    pub fn halve(&mut self) {
        for row in &mut self.rows {
            for counter in row.iter_mut() {
                *counter >>= 1;
            }
        }
    }

    /// The raw counter grid, for snapshots.
    pub fn rows(&self) -> &[Vec<u32>] {
        &self.rows
    }

    /// Replace the counter grid from a snapshot. Fails (returns `false`)
    /// when the dimensions do not match this sketch.
    pub fn restore_rows(&mut self, rows: Vec<Vec<u32>>) -> bool {
        if rows.len() != self.rows.len() || rows.iter().any(|row| row.len() != self.width) {
            return false;
        }
        self.rows = rows;
        true
    }
}
