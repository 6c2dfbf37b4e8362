use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::OptimizerKind;
use crate::{MlErr, Result};

/// The resumable state of an optimizer.
///
/// The scalar part is serialized with serde, the per parameter `buffers` are
/// stored as tensors next to the model's parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub kind: OptimizerKind,
    pub lr: f32,
    pub steps: u64,
    #[serde(skip)]
    pub buffers: BTreeMap<String, Vec<f32>>,
}

impl OptimizerState {
    /// Takes the buffer `name` out of the state, checking it holds `len` values.
    pub(super) fn take_buffer(&mut self, name: &str, len: usize) -> Result<Option<Box<[f32]>>> {
        match self.buffers.remove(name) {
            Some(buf) if buf.len() != len => Err(MlErr::SizeMismatch {
                what: "optimizer buffer",
                got: buf.len(),
                expected: len,
            }),
            Some(buf) => Ok(Some(buf.into_boxed_slice())),
            None => Ok(None),
        }
    }

    pub(super) fn expect_kind(&self, kind: OptimizerKind) -> Result<()> {
        if self.kind != kind {
            return Err(MlErr::InvalidConfig(format!(
                "can't load {} optimizer state into {kind}",
                self.kind
            )));
        }
        Ok(())
    }
}

/// Defines the strategy for updating model parameters based on calculated gradients.
pub trait Optimizer: Send {
    /// Updates the parameters using the given gradient.
    ///
    /// # Arguments
    /// * `params` - The parameters to update.
    /// * `grad` - The gradient of the loss with respect to `params`.
    ///
    /// # Returns
    /// An error if there's a mismatch in the sizes of `params` and `grad`.
    fn step(&mut self, params: &mut [f32], grad: &[f32]) -> Result<()>;

    /// The current learning rate.
    fn lr(&self) -> f32;

    /// Overrides the learning rate, used by schedules between epochs.
    fn set_lr(&mut self, lr: f32);

    fn state(&self) -> OptimizerState;

    fn load_state(&mut self, state: OptimizerState) -> Result<()>;
}

pub(super) fn check_len(params: &[f32], grad: &[f32], expected: usize) -> Result<()> {
    for got in [params.len(), grad.len()] {
        if got != expected {
            return Err(MlErr::SizeMismatch {
                what: "optimizer step",
                got,
                expected,
            });
        }
    }
    Ok(())
}
