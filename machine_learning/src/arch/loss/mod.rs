mod loss_fn;
mod mse;

pub use loss_fn::LossFn;
pub use mse::Mse;

use ndarray::Array2;

/// Encodes class indices as one-hot rows over `num_classes` columns.
pub fn one_hot(targets: &[usize], num_classes: usize) -> Array2<f32> {
    let mut y = Array2::zeros((targets.len(), num_classes));
    for (row, &t) in targets.iter().enumerate() {
        if t < num_classes {
            y[[row, t]] = 1.;
        }
    }
    y
}
