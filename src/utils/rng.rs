//! Deterministic seeding for batched environments.
//!
//! A batched env owns one RNG stream per episode index. [`SeedSequence`]
//! expands a single root seed into independent per-index sub-seeds so that
//! index `i` of an env built with seed `s` always replays the same way,
//! whatever `num` is.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Default RNG stream used across the crate.
pub type RngStream = ChaCha8Rng;

/// SplitMix64 expansion of a root seed into sub-seeds.
#[derive(Clone, Debug)]
pub struct SeedSequence {
    state: u64,
}

impl SeedSequence {
    pub fn new(seed: u64) -> Self {
        Self { state: seed ^ 0x9E37_79B9_7F4A_7C15 }
    }

    /// Next sub-seed in the sequence.
    pub fn next_subseed(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    pub fn next_rng(&mut self) -> RngStream {
        RngStream::seed_from_u64(self.next_subseed())
    }

    /// One independent stream per episode index.
    pub fn streams(&mut self, num: usize) -> Vec<RngStream> {
        (0..num).map(|_| self.next_rng()).collect()
    }
}

/// Split a root seed into `n` sub-seeds.
pub fn split_n(seed: u64, n: usize) -> Vec<u64> {
    let mut ss = SeedSequence::new(seed);
    (0..n).map(|_| ss.next_subseed()).collect()
}
