use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

use super::ShardSpec;

/// Decides which dataset indices an epoch visits and in which order.
#[derive(Debug, Clone, PartialEq)]
pub enum Sampler {
    Sequential,
    /// A fresh permutation every epoch, seeded by `seed` and the epoch.
    Random { seed: u64, epoch: usize },
    /// This rank's share of a (possibly shuffled) padded index list.
    Distributed {
        shard: ShardSpec,
        shuffle: bool,
        seed: u64,
        epoch: usize,
    },
}

impl Sampler {
    pub fn random(seed: u64) -> Self {
        Self::Random { seed, epoch: 0 }
    }

    pub fn distributed(shard: ShardSpec, shuffle: bool, seed: u64) -> Self {
        Self::Distributed {
            shard,
            shuffle,
            seed,
            epoch: 0,
        }
    }

    /// Changes the epoch the next `indices` call shuffles for.
    pub fn set_epoch(&mut self, new_epoch: usize) {
        match self {
            Self::Sequential => {}
            Self::Random { epoch, .. } | Self::Distributed { epoch, .. } => *epoch = new_epoch,
        }
    }

    /// The amount of indices `indices(len)` yields.
    pub fn num_samples(&self, len: usize) -> usize {
        match self {
            Self::Distributed { shard, .. } => shard.num_samples(len),
            _ => len,
        }
    }

    pub fn indices(&self, len: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..len).collect();

        match *self {
            Self::Sequential => indices,
            Self::Random { seed, epoch } => {
                let mut rng = StdRng::seed_from_u64(super::sample_seed(seed, epoch, usize::MAX));
                indices.shuffle(&mut rng);
                indices
            }
            Self::Distributed {
                shard,
                shuffle,
                seed,
                epoch,
            } => {
                if shuffle {
                    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
                    indices.shuffle(&mut rng);
                }
                shard.select(indices)
            }
        }
    }
}
