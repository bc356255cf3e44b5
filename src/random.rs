//! Utilities related to random numbers.

use crate::constants::PI;
use crate::geometry::{fgd, Vec3};
use rand::{Rng, RngCore, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};

/// Number of draws used to warm up a freshly seeded stream.
const WARMUP_DRAWS: usize = 100;

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(0);

/// An independent random number stream for one worker thread.
///
/// Streams are seeded from (global seed) XOR (rank) XOR (worker id) so that
/// every worker on every process draws from a distinct sequence, and advanced
/// through a warm-up block before use.
pub struct RandomStream {
    rng: rand::rngs::StdRng,
}

impl RandomStream {
    /// Creates a stream for the next unclaimed worker id on this process.
    pub fn for_next_worker(global_seed: u64, rank: u64) -> Self {
        let worker_id = NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed);
        Self::new(global_seed, rank, worker_id)
    }

    /// Creates a stream with an explicit worker id.
    pub fn new(global_seed: u64, rank: u64, worker_id: u64) -> Self {
        let mut rng = rand::rngs::StdRng::seed_from_u64(global_seed ^ rank ^ worker_id);
        for _ in 0..WARMUP_DRAWS {
            rng.next_u64();
        }
        Self { rng }
    }

    /// Draws a uniform sample in [0, 1).
    pub fn uniform(&mut self) -> fgd {
        self.rng.gen::<fgd>()
    }

    /// Draws a uniform sample in (0, 1].
    pub fn uniform_pos(&mut self) -> fgd {
        1.0 - self.rng.gen::<fgd>()
    }

    /// Draws a random optical depth tau = -ln(U) with U uniform in (0, 1].
    pub fn optical_depth(&mut self) -> fgd {
        -fgd::ln(self.uniform_pos())
    }

    /// Draws an isotropically distributed unit vector.
    pub fn isotropic_direction(&mut self) -> Vec3<fgd> {
        let costheta = 2.0 * self.uniform() - 1.0;
        let phi = 2.0 * PI * self.uniform();
        let sintheta = (1.0 - costheta * costheta).sqrt();
        Vec3::new(sintheta * phi.cos(), sintheta * phi.sin(), costheta)
    }

    /// Samples an index from the given cumulative distribution.
    ///
    /// The distribution does not have to be normalized; the last entry is
    /// taken as the total. Returns the first index whose cumulative value
    /// exceeds the drawn target.
    pub fn sample_cumulative(&mut self, cumulative: &[fgd]) -> usize {
        debug_assert!(!cumulative.is_empty());
        let target = self.uniform() * cumulative[cumulative.len() - 1];
        match cumulative.binary_search_by(|value| {
            value
                .partial_cmp(&target)
                .expect("Float comparison failed")
        }) {
            Ok(exact_idx) => exact_idx,
            Err(adjacent_idx) => adjacent_idx.min(cumulative.len() - 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_seeds_give_identical_streams() {
        let mut a = RandomStream::new(42, 0, 3);
        let mut b = RandomStream::new(42, 0, 3);
        for _ in 0..10 {
            assert_eq!(a.uniform(), b.uniform());
        }
    }

    #[test]
    fn distinct_workers_give_distinct_streams() {
        let mut a = RandomStream::new(42, 0, 0);
        let mut b = RandomStream::new(42, 0, 1);
        let same = (0..10).all(|_| a.uniform() == b.uniform());
        assert!(!same);
    }

    #[test]
    fn isotropic_directions_are_unit_vectors() {
        let mut stream = RandomStream::new(7, 0, 0);
        for _ in 0..100 {
            let dir = stream.isotropic_direction();
            assert!((dir.length() - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn cumulative_sampling_respects_weights() {
        let mut stream = RandomStream::new(11, 0, 0);
        // All the weight in the middle entry.
        let cumulative = [0.0, 1.0, 1.0];
        for _ in 0..50 {
            assert_eq!(stream.sample_cumulative(&cumulative), 1);
        }
    }
}
