//! Small numeric helpers shared by the merge rules.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::partial::ShardId;

/// Neumaier compensated summation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CompensatedSum {
    sum: f64,
    compensation: f64,
}

impl CompensatedSum {
    pub fn add(&mut self, value: f64) {
        let t = self.sum + value;
        if self.sum.abs() >= value.abs() {
            self.compensation += (self.sum - t) + value;
        } else {
            self.compensation += (value - t) + self.sum;
        }
        self.sum = t;
    }

    pub fn value(&self) -> f64 {
        self.sum + self.compensation
    }
}

/// Element-wise compensated accumulator for fixed-length vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct CompensatedVec {
    cells: Vec<CompensatedSum>,
}

impl CompensatedVec {
    pub fn zeros(len: usize) -> Self {
        Self {
            cells: vec![CompensatedSum::default(); len],
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn add_slice<'a>(&mut self, values: impl IntoIterator<Item = &'a f64>) {
        for (cell, value) in self.cells.iter_mut().zip(values) {
            cell.add(*value);
        }
    }

    pub fn values(&self) -> Vec<f64> {
        self.cells.iter().map(CompensatedSum::value).collect()
    }
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// Deterministic per-(shard, round) generator, independent of scheduling.
pub fn shard_rng(seed: u64, shard: ShardId, round: u32) -> ChaCha8Rng {
    let mixed = splitmix64(seed ^ splitmix64(((shard.0 as u64) << 32) | round as u64));
    ChaCha8Rng::seed_from_u64(mixed)
}

/// Generator used by master-side steps of `round`.
pub fn master_rng(seed: u64, round: u32) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(splitmix64(seed.rotate_left(17) ^ splitmix64(round as u64 + 1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn compensated_sum_recovers_lost_low_bits() {
        let mut sum = CompensatedSum::default();
        sum.add(1e16);
        for _ in 0..10 {
            sum.add(1.0);
        }
        sum.add(-1e16);
        assert_eq!(sum.value(), 10.0);
    }

    #[test]
    fn shard_rngs_are_reproducible_and_distinct() {
        let a: u64 = shard_rng(7, ShardId(1), 3).gen();
        let b: u64 = shard_rng(7, ShardId(1), 3).gen();
        let c: u64 = shard_rng(7, ShardId(2), 3).gen();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
