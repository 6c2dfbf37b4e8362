use ndarray::{Slice, prelude::*};

use crate::{MlErr, Result};

const TAU: f32 = 2.;
const V_THRESHOLD: f32 = 1.;
const V_RESET: f32 = 0.;
const SURROGATE_ALPHA: f32 = 4.;

struct Cache {
    h: Array2<f32>,
    s: Array2<f32>,
    steps: usize,
}

/// Multi-step leaky integrate-and-fire neurons with a hard reset.
///
/// For every time step `t`:
///
/// ```text
/// H[t] = V[t-1] + (X[t] - (V[t-1] - V_reset)) / tau
/// S[t] = heaviside(H[t] - V_threshold)
/// V[t] = H[t] * (1 - S[t]) + V_reset * S[t]
/// ```
///
/// The heaviside step is differentiated through a sigmoid surrogate and the
/// reset term is detached from the graph. The membrane potential is kept
/// between `forward` calls until `reset` is called.
pub struct Lif {
    features: usize,
    v: Option<Array2<f32>>,
    train: bool,
    cache: Option<Cache>,
}

impl Lif {
    pub fn new(features: usize) -> Self {
        Self {
            features,
            v: None,
            train: true,
            cache: None,
        }
    }

    pub fn set_train(&mut self, train: bool) {
        self.train = train;
    }

    /// Runs the neurons over `steps` time-major blocks of `x`.
    ///
    /// # Arguments
    /// * `x` - The input current, `steps * batch` rows of `features` columns.
    /// * `steps` - The amount of time steps stacked in `x`.
    ///
    /// # Returns
    /// The emitted spikes, with the same shape as `x`.
    pub fn forward(&mut self, x: Array2<f32>, steps: usize) -> Result<Array2<f32>> {
        let (rows, cols) = x.dim();
        if cols != self.features {
            return Err(MlErr::SizeMismatch {
                what: "lif features",
                got: cols,
                expected: self.features,
            });
        }
        if steps == 0 || rows % steps != 0 {
            return Err(MlErr::StepsMismatch { rows, steps });
        }

        let batch = rows / steps;
        let mut v = match self.v.take() {
            Some(v) if v.nrows() != batch => {
                return Err(MlErr::StaleState {
                    layer: "lif",
                    got: batch,
                    expected: v.nrows(),
                });
            }
            Some(v) => v,
            None => Array2::from_elem((batch, cols), V_RESET),
        };

        let mut h = Array2::zeros((rows, cols));
        let mut s = Array2::zeros((rows, cols));

        for t in 0..steps {
            let block = Slice::from(t * batch..(t + 1) * batch);
            let x_t = x.slice_axis(Axis(0), block);
            let mut h_t = h.slice_axis_mut(Axis(0), block);
            let mut s_t = s.slice_axis_mut(Axis(0), block);

            azip!((h in &mut h_t, spike in &mut s_t, v in &mut v, &xi in &x_t) {
                *h = *v + (xi - (*v - V_RESET)) / TAU;
                *spike = if *h - V_THRESHOLD >= 0. { 1. } else { 0. };
                *v = *h * (1. - *spike) + V_RESET * *spike;
            });
        }

        self.v = Some(v);
        if self.train {
            self.cache = Some(Cache {
                h,
                s: s.clone(),
                steps,
            });
        }

        Ok(s)
    }

    /// Backpropagates through time the gradient of the emitted spikes.
    pub fn backward(&mut self, d: Array2<f32>) -> Result<Array2<f32>> {
        let Cache { h, s, steps } = self
            .cache
            .take()
            .ok_or(MlErr::NoForwardCache { layer: "lif" })?;

        if d.dim() != h.dim() {
            return Err(MlErr::SizeMismatch {
                what: "lif gradient",
                got: d.len(),
                expected: h.len(),
            });
        }

        let batch = h.nrows() / steps;
        let mut dx = Array2::<f32>::zeros(h.dim());
        let mut dv = Array2::<f32>::zeros((batch, self.features));

        for t in (0..steps).rev() {
            let block = Slice::from(t * batch..(t + 1) * batch);
            let mut dx_t = dx.slice_axis_mut(Axis(0), block);

            azip!((dx in &mut dx_t, dv in &mut dv, &hi in &h.slice_axis(Axis(0), block), &si in &s.slice_axis(Axis(0), block), &ds in &d.slice_axis(Axis(0), block)) {
                let dh = ds * surrogate_grad(hi - V_THRESHOLD) + *dv * (1. - si);
                *dx = dh / TAU;
                *dv = dh * (1. - 1. / TAU);
            });
        }

        Ok(dx)
    }

    /// Forgets the membrane potential and any pending backward cache.
    pub fn reset(&mut self) {
        self.v = None;
        self.cache = None;
    }
}

fn surrogate_grad(x: f32) -> f32 {
    let sg = 1. / (1. + (-SURROGATE_ALPHA * x).exp());
    SURROGATE_ALPHA * sg * (1. - sg)
}
