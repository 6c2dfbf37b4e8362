//! Turning static images into spike trains and spike outputs back into rates.

use ndarray::{Slice, prelude::*};
use rand::Rng;

use crate::{MlErr, Result};

/// Bernoulli rate coding: a pixel of intensity `x` fires with probability `x`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PoissonEncoder;

impl PoissonEncoder {
    pub fn new() -> Self {
        Self
    }

    /// Samples one binary spike frame.
    ///
    /// # Arguments
    /// * `x` - The intensities, values outside `[0, 1]` saturate.
    /// * `rng` - The source of randomness.
    ///
    /// # Returns
    /// `1.0` wherever a uniform sample `u ∈ [0, 1)` falls below the intensity, `0.0` elsewhere.
    pub fn encode<R: Rng + ?Sized>(&self, x: ArrayView2<f32>, rng: &mut R) -> Array2<f32> {
        x.mapv(|v| if rng.random::<f32>() < v { 1. } else { 0. })
    }
}

/// Stacks `steps` copies of `x` on top of each other (time-major).
pub fn repeat_steps(x: ArrayView2<f32>, steps: usize) -> Result<Array2<f32>> {
    if steps == 0 {
        return Err(MlErr::StepsMismatch {
            rows: x.nrows(),
            steps,
        });
    }

    let views = vec![x; steps];
    Ok(ndarray::concatenate(Axis(0), &views)?)
}

/// Averages the `steps` time-major blocks of `y` into one block.
pub fn mean_over_steps(y: ArrayView2<f32>, steps: usize) -> Result<Array2<f32>> {
    let rows = y.nrows();
    if steps == 0 || rows % steps != 0 {
        return Err(MlErr::StepsMismatch { rows, steps });
    }

    let batch = rows / steps;
    let mut out = Array2::zeros((batch, y.ncols()));
    for t in 0..steps {
        out += &y.slice_axis(Axis(0), Slice::from(t * batch..(t + 1) * batch));
    }

    Ok(out / steps as f32)
}

/// The adjoint of `mean_over_steps`: every time step receives `d / steps`.
pub fn spread_over_steps(d: ArrayView2<f32>, steps: usize) -> Result<Array2<f32>> {
    let scaled = d.mapv(|v| v / steps.max(1) as f32);
    repeat_steps(scaled.view(), steps)
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn saturated_pixels_are_deterministic() {
        let mut rng = StdRng::seed_from_u64(3);
        let x = array![[0.0, 1.0, 1.5, -0.5]];

        for _ in 0..20 {
            assert_eq!(
                PoissonEncoder.encode(x.view(), &mut rng),
                array![[0.0, 1.0, 1.0, 0.0]]
            );
        }
    }

    #[test]
    fn firing_rate_follows_intensity() {
        let mut rng = StdRng::seed_from_u64(11);
        let x = Array2::from_elem((100, 100), 0.3);

        let rate = PoissonEncoder.encode(x.view(), &mut rng).mean().unwrap();
        assert!((rate - 0.3).abs() < 0.02);
    }

    #[test]
    fn steps_are_stacked_time_major() {
        let x = array![[1.0, 2.0], [3.0, 4.0]];
        let stacked = repeat_steps(x.view(), 3).unwrap();

        assert_eq!(stacked.dim(), (6, 2));
        assert_eq!(stacked.row(4), x.row(0));
        assert_eq!(mean_over_steps(stacked.view(), 3).unwrap(), x);
    }

    #[test]
    fn spreading_is_the_adjoint_of_averaging() {
        let d = array![[3.0, 6.0]];
        let spread = spread_over_steps(d.view(), 3).unwrap();

        assert_eq!(spread, array![[1.0, 2.0], [1.0, 2.0], [1.0, 2.0]]);
        assert!(matches!(
            mean_over_steps(spread.view(), 2),
            Err(MlErr::StepsMismatch { rows: 3, steps: 2 })
        ));
    }
}
