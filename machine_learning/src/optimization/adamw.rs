use std::collections::BTreeMap;

use super::{Optimizer, OptimizerKind, OptimizerState, optimizer::check_len};
use crate::Result;

const BETA1: f32 = 0.9;
const BETA2: f32 = 0.999;
const EPSILON: f32 = 1e-8;

/// Adam with decoupled weight decay.
#[derive(Debug)]
pub struct AdamW {
    lr: f32,
    weight_decay: f32,
    steps: u64,
    v: Box<[f32]>,
    s: Box<[f32]>,
}

impl AdamW {
    /// Creates a new `AdamW` optimizer with `betas = (0.9, 0.999)` and `eps = 1e-8`.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `lr` - The small coefficient that modulates the amount of training per update.
    /// * `weight_decay` - The decoupled decay applied directly to the parameters.
    pub fn new(len: usize, lr: f32, weight_decay: f32) -> Self {
        Self {
            lr,
            weight_decay,
            steps: 0,
            v: vec![0.; len].into_boxed_slice(),
            s: vec![0.; len].into_boxed_slice(),
        }
    }
}

impl Optimizer for AdamW {
    fn step(&mut self, params: &mut [f32], grad: &[f32]) -> Result<()> {
        check_len(params, grad, self.v.len())?;

        self.steps += 1;

        let lr = self.lr;
        let decay = 1. - lr * self.weight_decay;
        let t = self.steps.min(i32::MAX as u64) as i32;
        let bc1 = 1. - BETA1.powi(t);
        let bc2 = 1. - BETA2.powi(t);
        let step_size = lr / bc1;
        let bc2_sqrt = bc2.sqrt();

        params
            .iter_mut()
            .zip(grad)
            .zip(self.v.iter_mut())
            .zip(self.s.iter_mut())
            .for_each(|(((p, g), v), s)| {
                *p *= decay;
                *v = BETA1 * *v + (1. - BETA1) * g;
                *s = BETA2 * *s + (1. - BETA2) * g.powi(2);
                *p -= step_size * *v / (s.sqrt() / bc2_sqrt + EPSILON);
            });

        Ok(())
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn state(&self) -> OptimizerState {
        OptimizerState {
            kind: OptimizerKind::AdamW,
            lr: self.lr,
            steps: self.steps,
            buffers: BTreeMap::from([
                ("exp_avg".to_string(), self.v.to_vec()),
                ("exp_avg_sq".to_string(), self.s.to_vec()),
            ]),
        }
    }

    fn load_state(&mut self, mut state: OptimizerState) -> Result<()> {
        state.expect_kind(OptimizerKind::AdamW)?;

        let len = self.v.len();
        let v = state.take_buffer("exp_avg", len)?;
        let s = state.take_buffer("exp_avg_sq", len)?;

        self.v = v.unwrap_or_else(|| vec![0.; len].into_boxed_slice());
        self.s = s.unwrap_or_else(|| vec![0.; len].into_boxed_slice());
        self.lr = state.lr;
        self.steps = state.steps;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MlErr;

    #[test]
    fn first_step_moves_by_the_learning_rate() {
        let mut adam = AdamW::new(2, 0.01, 0.);
        let mut params = [1.0, 1.0];

        adam.step(&mut params, &[3.0, -0.5]).unwrap();
        assert!((params[0] - 0.99).abs() < 1e-5);
        assert!((params[1] - 1.01).abs() < 1e-5);
    }

    #[test]
    fn decay_is_decoupled_from_the_gradient() {
        let mut adam = AdamW::new(1, 0.1, 0.5);
        let mut params = [2.0];

        adam.step(&mut params, &[0.0]).unwrap();
        assert!((params[0] - 1.9).abs() < 1e-6);
    }

    #[test]
    fn state_of_another_kind_is_rejected() {
        let mut adam = AdamW::new(1, 0.1, 0.);
        let sgd = super::super::Sgd::new(1, 0.1, 0.9, 0.);

        assert!(matches!(
            adam.load_state(sgd.state()),
            Err(MlErr::InvalidConfig(_))
        ));
    }
}
