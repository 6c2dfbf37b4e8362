//! CIFAR-10 loading, augmentation, sampling and parallel batching.

mod cifar;
mod dataloader;
mod sampler;
mod shard;
mod transforms;

pub use cifar::{CIFAR10_CLASSES, Cifar10, IMAGE_BYTES, IMAGE_CHANNELS, IMAGE_SIDE};
pub use dataloader::{Batch, DataLoader};
pub use sampler::Sampler;
pub use shard::ShardSpec;
pub use transforms::{Image, Pipeline, Transform};

/// Derives an independent seed for one sample of one epoch.
///
/// The result only depends on its arguments, which makes augmentations
/// reproducible regardless of how samples are spread over threads.
pub fn sample_seed(seed: u64, epoch: usize, index: usize) -> u64 {
    let mut z = seed
        ^ (epoch as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (index as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F);

    // splitmix64 finalizer
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
