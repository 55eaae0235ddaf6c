//! Deterministic pseudo-random number generation.
//!
//! Sequence learning needs a generator that produces identical draws from a
//! seed on every platform and whose position survives serialization, so a
//! restored memory continues sampling exactly where the saved one left off.
//! The generator state is persisted as the pair (seed, steps): restoring
//! reseeds and replays `steps` draws.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// A seeded pseudo-random number generator.
///
/// Uses ChaCha20 for high-quality randomness with deterministic behavior
/// when seeded. Every draw consumes exactly one 64-bit word of the ChaCha
/// stream, so replaying `steps` draws lands on the exact stream position;
/// the (seed, steps) persistence below depends on this invariant.
///
/// # Example
///
/// ```rust
/// use veles::utils::Random;
///
/// let mut rng = Random::new(42);
///
/// // Generate random integers
/// let n = rng.get_uint32();
///
/// // Sample from a range
/// let idx = rng.get_usize(100);
/// # let _ = (n, idx);
/// ```
pub struct Random {
    rng: ChaCha20Rng,
    seed: u64,
    /// Number of random values generated (for state reconstruction).
    steps: u64,
}

// Custom serialization for Random - we serialize seed and steps,
// then reconstruct the RNG state on deserialization.
#[cfg(feature = "serde")]
mod serde_impl {
    use super::*;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct RandomState {
        seed: u64,
        steps: u64,
    }

    impl Serialize for Random {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            let state = RandomState {
                seed: self.seed,
                steps: self.steps,
            };
            state.serialize(serializer)
        }
    }

    impl<'de> Deserialize<'de> for Random {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            let state = RandomState::deserialize(deserializer)?;
            Ok(Random::from_state(state.seed, state.steps))
        }
    }
}

impl Random {
    /// Creates a new random number generator with the given seed.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha20Rng::seed_from_u64(seed),
            seed,
            steps: 0,
        }
    }

    /// Reconstructs a generator from a persisted (seed, steps) pair by
    /// reseeding and replaying `steps` draws.
    #[must_use]
    pub fn from_state(seed: u64, steps: u64) -> Self {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        // Advance the RNG to match the persisted state.
        for _ in 0..steps {
            let _: u64 = rng.gen();
        }
        Random { rng, seed, steps }
    }

    /// Returns the seed used for this generator.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Returns the number of random values generated.
    #[must_use]
    pub fn steps(&self) -> u64 {
        self.steps
    }

    fn draw(&mut self) -> u64 {
        self.steps += 1;
        self.rng.gen()
    }

    /// Generates a random u32.
    pub fn get_uint32(&mut self) -> u32 {
        self.draw() as u32
    }

    /// Generates a random u32 in the range [min, max).
    pub fn get_uint32_range(&mut self, min: u32, max: u32) -> u32 {
        let draw = self.draw();
        if min >= max {
            return min;
        }
        let span = u128::from(max - min);
        min + ((u128::from(draw) * span) >> 64) as u32
    }

    /// Generates a random usize in the range [0, n).
    pub fn get_usize(&mut self, n: usize) -> usize {
        let draw = self.draw();
        if n == 0 {
            return 0;
        }
        ((u128::from(draw) * (n as u128)) >> 64) as usize
    }

    /// Generates a random f32 in [0, 1).
    pub fn get_real32(&mut self) -> f32 {
        let draw = self.draw();
        // Use the top 24 bits: a full f32 mantissa's worth.
        ((draw >> 40) as f32) / (1u64 << 24) as f32
    }
}

impl Clone for Random {
    fn clone(&self) -> Self {
        Self {
            rng: self.rng.clone(),
            seed: self.seed,
            steps: self.steps,
        }
    }
}

impl std::fmt::Debug for Random {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Random")
            .field("seed", &self.seed)
            .field("steps", &self.steps)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        let mut rng1 = Random::new(42);
        let mut rng2 = Random::new(42);

        for _ in 0..100 {
            assert_eq!(rng1.get_uint32(), rng2.get_uint32());
        }
    }

    #[test]
    fn test_different_seeds() {
        let mut rng1 = Random::new(42);
        let mut rng2 = Random::new(43);

        let mut same = true;
        for _ in 0..100 {
            if rng1.get_uint32() != rng2.get_uint32() {
                same = false;
                break;
            }
        }
        assert!(!same);
    }

    #[test]
    fn test_range() {
        let mut rng = Random::new(42);

        for _ in 0..1000 {
            let v = rng.get_uint32_range(10, 20);
            assert!((10..20).contains(&v));
        }

        // Degenerate range collapses to min.
        assert_eq!(rng.get_uint32_range(7, 7), 7);
    }

    #[test]
    fn test_usize_bounds() {
        let mut rng = Random::new(42);

        for n in [1, 2, 3, 10, 1000] {
            for _ in 0..100 {
                assert!(rng.get_usize(n) < n);
            }
        }
        assert_eq!(rng.get_usize(0), 0);
    }

    #[test]
    fn test_small_bounds_hit_every_value() {
        let mut rng = Random::new(3);
        let mut seen = [false; 4];
        for _ in 0..200 {
            seen[rng.get_usize(4)] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_real_range() {
        let mut rng = Random::new(42);

        for _ in 0..1000 {
            let v = rng.get_real32();
            assert!((0.0..1.0).contains(&v));
        }
    }

    #[test]
    fn test_state_reconstruction() {
        let mut rng = Random::new(42);
        for _ in 0..17 {
            rng.get_usize(5);
        }

        // Replaying (seed, steps) must land on the same stream position.
        let mut replayed = Random::from_state(rng.seed(), rng.steps());
        for _ in 0..100 {
            assert_eq!(rng.get_uint32(), replayed.get_uint32());
        }
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_serde_round_trip() {
        let mut rng = Random::new(42);
        for _ in 0..17 {
            rng.get_uint32_range(0, 1000);
        }

        let bytes = bincode::serialize(&rng).unwrap();
        let mut restored: Random = bincode::deserialize(&bytes).unwrap();
        assert_eq!(restored.seed(), rng.seed());
        assert_eq!(restored.steps(), rng.steps());
        for _ in 0..100 {
            assert_eq!(rng.get_uint32(), restored.get_uint32());
        }
    }
}
