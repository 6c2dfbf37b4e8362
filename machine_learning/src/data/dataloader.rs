use std::sync::Arc;

use ndarray::Array2;
use rand::{SeedableRng, rngs::StdRng};
use rayon::{ThreadPool, ThreadPoolBuilder, prelude::*};

use super::{Cifar10, Pipeline, Sampler, sample_seed};
use crate::{MlErr, Result};

/// A materialised batch of transformed images.
#[derive(Debug, Clone)]
pub struct Batch {
    /// One flattened `C×S×S` image per row.
    pub images: Array2<f32>,
    pub targets: Vec<usize>,
}

impl Batch {
    #[inline]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Sampler-driven loader that transforms each batch on its own thread pool.
pub struct DataLoader {
    dataset: Arc<Cifar10>,
    pipeline: Pipeline,
    sampler: Sampler,
    batch_size: usize,
    seed: u64,
    pool: ThreadPool,

    epoch: usize,
    order: Vec<usize>,
    cursor: usize,
}

impl DataLoader {
    /// Creates a new `DataLoader`.
    ///
    /// # Arguments
    /// * `dataset` - The samples to load.
    /// * `pipeline` - The transforms applied to every sample.
    /// * `sampler` - The order in which samples are visited.
    /// * `batch_size` - The maximum amount of samples per batch, the last one may be smaller.
    /// * `workers` - The amount of threads transforming samples.
    /// * `seed` - The seed per-sample augmentations are derived from.
    pub fn new(
        dataset: Arc<Cifar10>,
        pipeline: Pipeline,
        sampler: Sampler,
        batch_size: usize,
        workers: usize,
        seed: u64,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(MlErr::InvalidConfig("batch size must be positive".into()));
        }

        let pool = ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("data-loader-{i}"))
            .build()
            .map_err(|e| MlErr::InvalidConfig(format!("data loader pool: {e}")))?;

        let order = sampler.indices(dataset.len());

        Ok(Self {
            dataset,
            pipeline,
            sampler,
            batch_size,
            seed,
            pool,
            epoch: 0,
            order,
            cursor: 0,
        })
    }

    pub fn dataset(&self) -> &Cifar10 {
        &self.dataset
    }

    /// Reshuffles for `epoch` and rewinds to the first batch.
    pub fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
        self.sampler.set_epoch(epoch);
        self.order = self.sampler.indices(self.dataset.len());
        self.cursor = 0;
    }

    /// The amount of samples this loader yields per epoch.
    pub fn num_samples(&self) -> usize {
        self.order.len()
    }

    /// The amount of batches per epoch.
    pub fn num_batches(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }

    /// Rewinds to the first batch keeping the current order.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Returns the next batch of the epoch, or `None` once exhausted.
    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }

        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = &self.order[self.cursor..end];
        self.cursor = end;

        let (dataset, pipeline, seed, epoch) = (&*self.dataset, &self.pipeline, self.seed, self.epoch);
        let samples: Vec<Vec<f32>> = self.pool.install(|| {
            indices
                .par_iter()
                .map(|&idx| {
                    let mut rng = StdRng::seed_from_u64(sample_seed(seed, epoch, idx));
                    pipeline
                        .apply(dataset.image(idx), &mut rng)
                        .map(|image| image.data)
                })
                .collect::<Result<_>>()
        })?;

        let features = samples.first().map_or(0, Vec::len);
        let flat: Vec<f32> = samples.into_iter().flatten().collect();
        let images = Array2::from_shape_vec((indices.len(), features), flat)?;
        let targets = indices.iter().map(|&i| dataset.label(i)).collect();

        Ok(Some(Batch { images, targets }))
    }
}
