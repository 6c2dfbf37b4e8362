use half::f16;
use log::debug;
use ndarray::ArrayViewMut2;
use serde::{Deserialize, Serialize};

use crate::{Result, optimization::Optimizer};

const INIT_SCALE: f32 = 65536.;
const GROWTH_FACTOR: f32 = 2.;
const BACKOFF_FACTOR: f32 = 0.5;
const GROWTH_INTERVAL: u32 = 2000;

/// The resumable state of a `GradScaler`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalerState {
    pub scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    pub growth_interval: u32,
    pub growth_tracker: u32,
}

/// Dynamic loss scaling for half precision gradients.
///
/// Each iteration goes through `scale_grad`, `to_half`, an optional
/// `unscale`, `step` and finally `update`.
#[derive(Debug, Clone)]
pub struct GradScaler {
    state: ScalerState,
    unscaled: bool,
    found_inf: bool,
}

impl Default for GradScaler {
    fn default() -> Self {
        Self::new()
    }
}

impl GradScaler {
    pub fn new() -> Self {
        Self {
            state: ScalerState {
                scale: INIT_SCALE,
                growth_factor: GROWTH_FACTOR,
                backoff_factor: BACKOFF_FACTOR,
                growth_interval: GROWTH_INTERVAL,
                growth_tracker: 0,
            },
            unscaled: false,
            found_inf: false,
        }
    }

    pub fn scale(&self) -> f32 {
        self.state.scale
    }

    /// Multiplies the seed gradient of the backward pass by the current scale.
    pub fn scale_grad(&self, mut d: ArrayViewMut2<'_, f32>) {
        d *= self.state.scale;
    }

    /// Rounds every gradient to half precision, overflowing values become infinite.
    pub fn to_half(&self, grad: &mut [f32]) {
        grad.iter_mut().for_each(|g| *g = f16::from_f32(*g).to_f32());
    }

    /// Divides the gradient by the scale, recording whether any value is not finite.
    ///
    /// # Returns
    /// Whether non finite values were found. Calling it twice in the same
    /// iteration is a no-op.
    pub fn unscale(&mut self, grad: &mut [f32]) -> bool {
        if self.unscaled {
            return self.found_inf;
        }

        let inv_scale = 1. / self.state.scale;
        let mut found_inf = false;
        for g in grad.iter_mut() {
            *g *= inv_scale;
            found_inf |= !g.is_finite();
        }

        self.unscaled = true;
        self.found_inf = found_inf;
        found_inf
    }

    /// Steps the optimizer unless the gradient holds non finite values.
    ///
    /// # Returns
    /// Whether the optimizer was stepped.
    pub fn step(
        &mut self,
        optimizer: &mut dyn Optimizer,
        params: &mut [f32],
        grad: &mut [f32],
    ) -> Result<bool> {
        if self.unscale(grad) {
            debug!(scale = self.state.scale; "skipping optimizer step on non finite gradients");
            return Ok(false);
        }

        optimizer.step(params, grad)?;
        Ok(true)
    }

    /// Backs the scale off after an overflow, or grows it after
    /// `growth_interval` clean iterations.
    pub fn update(&mut self) {
        let state = &mut self.state;

        if self.found_inf {
            state.scale *= state.backoff_factor;
            state.growth_tracker = 0;
        } else {
            state.growth_tracker += 1;
            if state.growth_tracker >= state.growth_interval {
                state.scale *= state.growth_factor;
                state.growth_tracker = 0;
            }
        }

        self.unscaled = false;
        self.found_inf = false;
    }

    pub fn state(&self) -> ScalerState {
        self.state
    }

    pub fn load_state(&mut self, state: ScalerState) {
        self.state = state;
        self.unscaled = false;
        self.found_inf = false;
    }
}
