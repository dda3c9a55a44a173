//! Deterministic RNG wrapper and seed-derivation helpers.

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use siphasher::sip::SipHasher13;
use std::hash::Hasher;

/// Deterministic RNG handle handed to priors, kernels and simulators.
///
/// Each sampling trial owns its own handle. Handles are never shared between
/// concurrent trials; substreams are derived by hashing `(master_seed,
/// substream_id)` with SipHash-1-3 configured with fixed zero keys, which keeps
/// the derivation stable across platforms and thread counts.
#[derive(Debug, Clone)]
pub struct RngHandle {
    rng: StdRng,
}

impl RngHandle {
    /// Creates a new RNG handle from a seed.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Returns a mutable reference to the underlying RNG for advanced usage.
    pub fn inner_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Draws a uniform value in `[0, 1)`.
    pub fn uniform(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    /// Draws an index from a cumulative weight table (last entry is the total mass).
    ///
    /// Returns `None` when the table is empty or carries no mass.
    pub fn categorical(&mut self, cumulative: &[f64]) -> Option<usize> {
        let total = *cumulative.last()?;
        if !(total > 0.0) || !total.is_finite() {
            return None;
        }
        let target = self.uniform() * total;
        let mut index = cumulative
            .partition_point(|&mass| mass <= target)
            .min(cumulative.len() - 1);
        // Rounding can push the target onto the upper edge; never land on a zero-mass slot.
        while index > 0 && cumulative[index] == cumulative[index - 1] {
            index -= 1;
        }
        Some(index)
    }
}

impl RngCore for RngHandle {
    fn next_u32(&mut self) -> u32 {
        self.rng.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.rng.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.rng.try_fill_bytes(dest)
    }
}

/// Derives the deterministic seed for a specific substream.
pub fn derive_substream_seed(master_seed: u64, substream: u64) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(0, 0);
    hasher.write_u64(master_seed);
    hasher.write_u64(substream);
    hasher.finish()
}

/// Hashes an arbitrary label (e.g. a run identifier) into a substream key.
pub fn label_key(label: &str) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(0, 0);
    hasher.write(label.as_bytes());
    hasher.finish()
}
