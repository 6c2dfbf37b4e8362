use std::collections::BTreeMap;

use super::{Optimizer, OptimizerKind, OptimizerState, optimizer::check_len};
use crate::Result;

const MOMENTUM_BUFFER: &str = "momentum_buffer";

/// Stochastic gradient descent with momentum and L2 weight decay.
#[derive(Debug)]
pub struct Sgd {
    len: usize,
    lr: f32,
    momentum: f32,
    weight_decay: f32,
    steps: u64,
    velocity: Option<Box<[f32]>>,
}

impl Sgd {
    /// Creates a new `Sgd` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `lr` - The small coefficient that modulates the amount of training per update.
    /// * `momentum` - The decay of the velocity, `0` disables it.
    /// * `weight_decay` - The L2 penalty added to the gradient.
    pub fn new(len: usize, lr: f32, momentum: f32, weight_decay: f32) -> Self {
        Self {
            len,
            lr,
            momentum,
            weight_decay,
            steps: 0,
            velocity: None,
        }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut [f32], grad: &[f32]) -> Result<()> {
        check_len(params, grad, self.len)?;

        let Self {
            lr,
            momentum: mu,
            weight_decay: wd,
            ..
        } = *self;

        self.steps += 1;

        if mu == 0. {
            params
                .iter_mut()
                .zip(grad)
                .for_each(|(p, g)| *p -= lr * (g + wd * *p));
            return Ok(());
        }

        let len = self.len;
        let first = self.velocity.is_none();
        let velocity = self
            .velocity
            .get_or_insert_with(|| vec![0.; len].into_boxed_slice());

        params
            .iter_mut()
            .zip(grad)
            .zip(velocity.iter_mut())
            .for_each(|((p, g), v)| {
                let d = g + wd * *p;
                *v = if first { d } else { mu * *v + d };
                *p -= lr * *v;
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
        let mut buffers = BTreeMap::new();
        if let Some(velocity) = &self.velocity {
            buffers.insert(MOMENTUM_BUFFER.to_string(), velocity.to_vec());
        }

        OptimizerState {
            kind: OptimizerKind::Sgd,
            lr: self.lr,
            steps: self.steps,
            buffers,
        }
    }

    fn load_state(&mut self, mut state: OptimizerState) -> Result<()> {
        state.expect_kind(OptimizerKind::Sgd)?;

        self.velocity = state.take_buffer(MOMENTUM_BUFFER, self.len)?;
        self.lr = state.lr;
        self.steps = state.steps;
        Ok(())
    }
}
