use std::ops::Range;

use ndarray::{linalg, prelude::*};
use rand::RngCore;
use rand_distr::{Distribution, Uniform};

use crate::{MlErr, Result, arch::ParamLayout};

/// A fully connected layer, `y = x·W + b`, applied to every row of its input.
#[derive(Debug, Clone)]
pub struct Linear {
    dim: (usize, usize),
    weight: Range<usize>,
    bias: Range<usize>,

    // Forward metadata
    x: Option<Array2<f32>>,
}

impl Linear {
    /// Creates a new `Linear` and registers its parameters.
    ///
    /// # Arguments
    /// * `layout` - The model's parameter layout.
    /// * `prefix` - The name prefix of this layer's tensors.
    /// * `dim` - The input and output feature counts.
    pub fn new(layout: &mut ParamLayout, prefix: &str, dim: (usize, usize)) -> Self {
        Self {
            dim,
            weight: layout.push(format!("{prefix}.weight"), &[dim.0, dim.1]),
            bias: layout.push(format!("{prefix}.bias"), &[dim.1]),
            x: None,
        }
    }

    /// Writes initial parameters, sampled from `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`.
    pub fn init(&self, params: &mut [f32], rng: &mut dyn RngCore) -> Result<()> {
        let bound = 1. / (self.dim.0 as f32).sqrt();
        let dist = Uniform::new_inclusive(-bound, bound)
            .map_err(|e| MlErr::InvalidConfig(format!("linear init: {e}")))?;

        for p in &mut params[self.weight.start..self.bias.end] {
            *p = dist.sample(&mut *rng);
        }

        Ok(())
    }

    pub fn forward(&mut self, params: &[f32], x: Array2<f32>) -> Result<Array2<f32>> {
        if x.ncols() != self.dim.0 {
            return Err(MlErr::SizeMismatch {
                what: "linear input features",
                got: x.ncols(),
                expected: self.dim.0,
            });
        }

        let (w, b) = self.view_params(params)?;
        let z = x.dot(&w) + &b;

        self.x = Some(x);
        Ok(z)
    }

    pub fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        d: Array2<f32>,
    ) -> Result<Array2<f32>> {
        let x = self
            .x
            .take()
            .ok_or(MlErr::NoForwardCache { layer: "linear" })?;

        let (mut dw, mut db) = self.view_grad(grad)?;
        linalg::general_mat_mul(1.0, &x.t(), &d, 1.0, &mut dw);
        db += &d.sum_axis(Axis(0));

        let (w, _) = self.view_params(params)?;
        Ok(d.dot(&w.t()))
    }

    /// Gives a view of the raw parameter slice as the weights and biases of this layer.
    fn view_params<'a>(&self, params: &'a [f32]) -> Result<(ArrayView2<'a, f32>, ArrayView1<'a, f32>)> {
        let weights = ArrayView2::from_shape(self.dim, &params[self.weight.clone()])?;
        let biases = ArrayView1::from_shape(self.dim.1, &params[self.bias.clone()])?;
        Ok((weights, biases))
    }

    /// Gives a view of the raw gradient slice as the delta weights and delta biases of this layer.
    fn view_grad<'a>(
        &self,
        grad: &'a mut [f32],
    ) -> Result<(ArrayViewMut2<'a, f32>, ArrayViewMut1<'a, f32>)> {
        let (dw_raw, db_raw) = grad[self.weight.start..self.bias.end].split_at_mut(self.weight.len());
        let dw = ArrayViewMut2::from_shape(self.dim, dw_raw)?;
        let db = ArrayViewMut1::from_shape(self.dim.1, db_raw)?;
        Ok((dw, db))
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn forward_and_backward_match_hand_computation() {
        let mut layout = ParamLayout::new();
        let mut fc = Linear::new(&mut layout, "fc", (2, 1));
        let params = [2.0, -1.0, 0.5];
        let mut grad = vec![0.; layout.size()];

        let x = array![[1.0, 3.0], [0.0, 1.0]];
        let y = fc.forward(&params, x).unwrap();
        assert_eq!(y, array![[-0.5], [-0.5]]);

        let dx = fc.backward(&params, &mut grad, array![[1.0], [2.0]]).unwrap();
        assert_eq!(grad, vec![1.0, 5.0, 3.0]);
        assert_eq!(dx, array![[2.0, -1.0], [4.0, -2.0]]);
    }

    #[test]
    fn init_stays_within_bounds() {
        let mut layout = ParamLayout::new();
        let fc = Linear::new(&mut layout, "fc", (16, 4));
        let mut params = vec![0.; layout.size()];

        fc.init(&mut params, &mut StdRng::seed_from_u64(7)).unwrap();
        assert!(params.iter().all(|p| p.abs() <= 0.25));
        assert!(params.iter().any(|&p| p != 0.));
    }

    #[test]
    fn backward_without_forward_fails() {
        let mut layout = ParamLayout::new();
        let mut fc = Linear::new(&mut layout, "fc", (2, 2));
        let params = vec![0.; layout.size()];
        let mut grad = params.clone();

        let err = fc.backward(&params, &mut grad, Array2::zeros((1, 2)));
        assert!(matches!(err, Err(MlErr::NoForwardCache { .. })));
    }
}
