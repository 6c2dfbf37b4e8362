use ndarray::{Array2, ArrayView2};

use super::LossFn;

/// Mean squared error over every element of the batch.
#[derive(Default, Clone, Copy)]
pub struct Mse;

impl Mse {
    /// Returns a new `Mse`.
    pub fn new() -> Self {
        Self
    }
}

impl LossFn for Mse {
    fn loss(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> f32 {
        (&y_pred - &y)
            .mapv(|x| x.powi(2))
            .mean()
            .unwrap_or_default()
    }

    fn loss_prime(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> Array2<f32> {
        (&y_pred - &y) * (2.0 / y_pred.len() as f32)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::arch::loss::one_hot;

    #[test]
    fn mse_against_one_hot_targets() {
        let y = one_hot(&[1, 0], 2);
        let y_pred = array![[0.0, 0.5], [1.0, 1.0]];

        // (0 + 0.25 + 0 + 1) / 4
        assert_eq!(Mse.loss(y_pred.view(), y.view()), 0.3125);
        assert_eq!(
            Mse.loss_prime(y_pred.view(), y.view()),
            array![[0.0, -0.25], [0.0, 0.5]]
        );
    }
}
