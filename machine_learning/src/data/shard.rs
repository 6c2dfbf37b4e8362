use std::num::NonZeroUsize;

use crate::{MlErr, Result};

/// The position of one rank within a data parallel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSpec {
    pub rank: usize,
    pub world_size: NonZeroUsize,
}

impl ShardSpec {
    pub fn new(rank: usize, world_size: NonZeroUsize) -> Result<Self> {
        if rank >= world_size.get() {
            return Err(MlErr::InvalidConfig(format!(
                "rank {rank} is out of range for a world of {world_size}"
            )));
        }

        Ok(Self { rank, world_size })
    }

    /// The amount of samples every rank sees, `ceil(total / world_size)`.
    #[inline]
    pub fn num_samples(self, total: usize) -> usize {
        total.div_ceil(self.world_size.get())
    }

    /// `total` rounded up to a multiple of the world size.
    #[inline]
    pub fn padded_len(self, total: usize) -> usize {
        self.num_samples(total) * self.world_size.get()
    }

    /// Pads `indices` by wrapping around to `padded_len` and keeps this rank's
    /// strided share, `indices[rank], indices[rank + world], ...`.
    pub fn select(self, mut indices: Vec<usize>) -> Vec<usize> {
        let total = indices.len();
        if total == 0 {
            return indices;
        }

        let padded = self.padded_len(total);
        for i in total..padded {
            indices.push(indices[i % total]);
        }

        indices
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size.get())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(rank: usize, world: usize) -> ShardSpec {
        ShardSpec::new(rank, NonZeroUsize::new(world).unwrap()).unwrap()
    }

    #[test]
    fn uneven_totals_are_padded_by_wrapping() {
        let indices: Vec<_> = (0..10).collect();

        assert_eq!(spec(0, 4).select(indices.clone()), vec![0, 4, 8]);
        assert_eq!(spec(2, 4).select(indices.clone()), vec![2, 6, 0]);
        assert_eq!(spec(3, 4).select(indices), vec![3, 7, 1]);
        assert_eq!(spec(0, 4).padded_len(10), 12);
    }

    #[test]
    fn ranks_outside_the_world_are_rejected() {
        assert!(ShardSpec::new(3, NonZeroUsize::new(3).unwrap()).is_err());
    }
}
