use std::{collections::BTreeMap, ops::Range};

use comms::Collective;
use ndarray::prelude::*;

use crate::{MlErr, Result, arch::ParamLayout};

const MOMENTUM: f32 = 0.1;
const EPS: f64 = 1e-5;

struct Cache {
    xhat: Array2<f32>,
    inv_std: Array1<f32>,
    count: f64,
}

/// Per-feature batch normalization over the rows of its input.
///
/// In training the statistics come from the batch, reduced through the given
/// collective: a real process group gives synchronized batch norm, `Solo` keeps
/// it local. In evaluation the running estimates are used.
pub struct BatchNorm {
    features: usize,
    gamma: Range<usize>,
    beta: Range<usize>,
    prefix: String,
    running_mean: Array1<f32>,
    running_var: Array1<f32>,
    train: bool,
    cache: Option<Cache>,
}

impl BatchNorm {
    pub fn new(layout: &mut ParamLayout, prefix: &str, features: usize) -> Self {
        Self {
            features,
            gamma: layout.push(format!("{prefix}.gamma"), &[features]),
            beta: layout.push(format!("{prefix}.beta"), &[features]),
            prefix: prefix.to_string(),
            running_mean: Array1::zeros(features),
            running_var: Array1::ones(features),
            train: true,
            cache: None,
        }
    }

    /// Writes the identity transform, `gamma = 1` and `beta = 0`.
    pub fn init(&self, params: &mut [f32]) {
        params[self.gamma.clone()].fill(1.);
        params[self.beta.clone()].fill(0.);
    }

    pub fn set_train(&mut self, train: bool) {
        self.train = train;
    }

    pub fn forward(
        &mut self,
        params: &[f32],
        x: Array2<f32>,
        sync: &mut dyn Collective,
    ) -> Result<Array2<f32>> {
        if x.ncols() != self.features {
            return Err(MlErr::SizeMismatch {
                what: "batch norm features",
                got: x.ncols(),
                expected: self.features,
            });
        }

        let gamma = ArrayView1::from_shape(self.features, &params[self.gamma.clone()])?;
        let beta = ArrayView1::from_shape(self.features, &params[self.beta.clone()])?;

        if !self.train {
            let inv_std = self
                .running_var
                .mapv(|v| (1. / (v as f64 + EPS).sqrt()) as f32);
            let xhat = (x - &self.running_mean) * &inv_std;
            return Ok(xhat * &gamma + &beta);
        }

        let (mean, inv_std, count) = self.batch_stats(&x, sync)?;
        let xhat = (x - &mean) * &inv_std;
        let y = &xhat * &gamma + &beta;

        self.cache = Some(Cache {
            xhat,
            inv_std,
            count,
        });

        Ok(y)
    }

    pub fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        d: Array2<f32>,
        sync: &mut dyn Collective,
    ) -> Result<Array2<f32>> {
        let Cache {
            xhat,
            inv_std,
            count,
        } = self
            .cache
            .take()
            .ok_or(MlErr::NoForwardCache { layer: "batch norm" })?;

        let gamma = ArrayView1::from_shape(self.features, &params[self.gamma.clone()])?;

        let dgamma = (&d * &xhat).sum_axis(Axis(0));
        let dbeta = d.sum_axis(Axis(0));
        for (g, dg) in grad[self.gamma.clone()].iter_mut().zip(&dgamma) {
            *g += dg;
        }
        for (g, db) in grad[self.beta.clone()].iter_mut().zip(&dbeta) {
            *g += db;
        }

        let dxhat = d * &gamma;

        let f = self.features;
        let mut sums = vec![0f64; 2 * f];
        for (row_d, row_x) in dxhat.rows().into_iter().zip(xhat.rows()) {
            for (j, (&dv, &xv)) in row_d.iter().zip(row_x).enumerate() {
                sums[j] += dv as f64;
                sums[f + j] += (dv * xv) as f64;
            }
        }
        sync.all_reduce_sum_f64(&mut sums)?;

        let mean_d = Array1::from_iter(sums[..f].iter().map(|s| (s / count) as f32));
        let mean_dx = Array1::from_iter(sums[f..].iter().map(|s| (s / count) as f32));

        let dx = (dxhat - &mean_d - &(xhat * &mean_dx)) * &inv_std;
        Ok(dx)
    }

    /// Appends the running statistics to `out`.
    pub fn buffers(&self, out: &mut BTreeMap<String, Vec<f32>>) {
        out.insert(
            format!("{}.running_mean", self.prefix),
            self.running_mean.to_vec(),
        );
        out.insert(
            format!("{}.running_var", self.prefix),
            self.running_var.to_vec(),
        );
    }

    pub fn load_buffers(&mut self, buffers: &BTreeMap<String, Vec<f32>>) -> Result<()> {
        let fetch = |suffix: &str| -> Result<Array1<f32>> {
            let name = format!("{}.{suffix}", self.prefix);
            let values = buffers.get(&name).ok_or(MlErr::MissingBuffer(name))?;

            if values.len() != self.features {
                return Err(MlErr::SizeMismatch {
                    what: "batch norm buffer",
                    got: values.len(),
                    expected: self.features,
                });
            }

            Ok(Array1::from_vec(values.clone()))
        };

        self.running_mean = fetch("running_mean")?;
        self.running_var = fetch("running_var")?;
        Ok(())
    }

    /// Computes the (possibly cross-rank) batch mean and inverse standard
    /// deviation, updating the running estimates on the way.
    fn batch_stats(
        &mut self,
        x: &Array2<f32>,
        sync: &mut dyn Collective,
    ) -> Result<(Array1<f32>, Array1<f32>, f64)> {
        let f = self.features;
        let mut stats = vec![0f64; 2 * f + 1];

        for row in x.rows() {
            for (j, &v) in row.iter().enumerate() {
                stats[j] += v as f64;
                stats[f + j] += (v as f64) * (v as f64);
            }
        }
        stats[2 * f] = x.nrows() as f64;
        sync.all_reduce_sum_f64(&mut stats)?;

        let count = stats[2 * f];
        if count < 1. {
            return Err(MlErr::SizeMismatch {
                what: "batch norm rows",
                got: 0,
                expected: 1,
            });
        }

        let mut mean = Array1::zeros(f);
        let mut inv_std = Array1::zeros(f);
        let unbias = if count > 1. { count / (count - 1.) } else { 1. };

        for j in 0..f {
            let m = stats[j] / count;
            let var = (stats[f + j] / count - m * m).max(0.);

            mean[j] = m as f32;
            inv_std[j] = (1. / (var + EPS).sqrt()) as f32;

            self.running_mean[j] = (1. - MOMENTUM) * self.running_mean[j] + MOMENTUM * m as f32;
            self.running_var[j] =
                (1. - MOMENTUM) * self.running_var[j] + MOMENTUM * (var * unbias) as f32;
        }

        Ok((mean, inv_std, count))
    }
}

#[cfg(test)]
mod tests {
    use comms::Solo;

    use super::*;

    fn layer(features: usize) -> (BatchNorm, Vec<f32>) {
        let mut layout = ParamLayout::new();
        let bn = BatchNorm::new(&mut layout, "bn", features);
        let mut params = vec![0.; layout.size()];
        bn.init(&mut params);
        (bn, params)
    }

    #[test]
    fn training_output_is_standardized() {
        let (mut bn, params) = layer(2);
        let x = array![[1.0, 10.0], [3.0, 10.0], [5.0, 10.0]];

        let y = bn.forward(&params, x, &mut Solo).unwrap();
        let mean = y.mean_axis(Axis(0)).unwrap();

        assert!(mean.iter().all(|m| m.abs() < 1e-5));
        assert!((y[[2, 0]] - 1.2247).abs() < 1e-3);
        assert_eq!(y[[0, 1]], 0.);
    }

    #[test]
    fn running_stats_move_towards_batch_stats() {
        let (mut bn, params) = layer(1);
        bn.forward(&params, array![[2.0], [4.0]], &mut Solo).unwrap();

        let mut buffers = BTreeMap::new();
        bn.buffers(&mut buffers);
        assert!((buffers["bn.running_mean"][0] - 0.3).abs() < 1e-6);
        // unbiased variance of [2, 4] is 2
        assert!((buffers["bn.running_var"][0] - 1.1).abs() < 1e-6);

        bn.set_train(false);
        let y = bn.forward(&params, array![[0.3]], &mut Solo).unwrap();
        assert!(y[[0, 0]].abs() < 1e-6);
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let x = array![[0.5, -1.0], [2.0, 0.25], [-1.5, 1.0], [0.0, 3.0]];
        let weights = array![[1.0, -2.0], [0.5, 1.5], [-1.0, 0.0], [2.0, 1.0]];
        let loss = |bn: &mut BatchNorm, params: &[f32], x: &Array2<f32>| -> f32 {
            let y = bn.forward(params, x.clone(), &mut Solo).unwrap();
            (&y * &weights).sum()
        };

        let (mut bn, params) = layer(2);
        loss(&mut bn, &params, &x);
        let mut grad = vec![0.; params.len()];
        let dx = bn
            .backward(&params, &mut grad, weights.clone(), &mut Solo)
            .unwrap();

        let h = 1e-2;
        for idx in [(0, 0), (2, 1), (3, 0)] {
            let mut plus = x.clone();
            plus[idx] += h;
            let mut minus = x.clone();
            minus[idx] -= h;

            let numeric = (loss(&mut bn, &params, &plus) - loss(&mut bn, &params, &minus)) / (2. * h);
            assert!((numeric - dx[idx]).abs() < 2e-2, "{idx:?}: {numeric} vs {}", dx[idx]);
        }
    }
}
