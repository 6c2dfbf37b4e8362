use std::collections::BTreeMap;

use comms::Collective;
use ndarray::{Array2, ArrayView2};
use rand::RngCore;

use super::ParamLayout;
use crate::Result;

/// A trainable network whose parameters live outside of it, in a flat buffer.
///
/// Spiking models carry membrane state across `forward` calls, `reset` must be
/// called once every batch has been processed so no activation leaks into the
/// next one.
pub trait Model: Send {
    /// Returns the amount of parameters in the model.
    fn size(&self) -> usize {
        self.layout().size()
    }

    /// Returns the description of the flat parameter buffer.
    fn layout(&self) -> &ParamLayout;

    /// Creates a freshly initialized parameter buffer.
    fn init_params(&self, rng: &mut dyn RngCore) -> Result<Vec<f32>>;

    /// Switches between training (batch statistics, backward caches) and evaluation behaviour.
    fn set_train(&mut self, train: bool);

    /// Makes a forward pass through the network.
    ///
    /// # Arguments
    /// * `params` - The model's parameters.
    /// * `x` - The time-major input, `steps` blocks of rows stacked on top of each other.
    /// * `steps` - The amount of simulated time steps in `x`.
    /// * `sync` - The group used to synchronize batch statistics.
    ///
    /// # Returns
    /// The time-major output, one row per input row.
    fn forward(
        &mut self,
        params: &[f32],
        x: ArrayView2<'_, f32>,
        steps: usize,
        sync: &mut dyn Collective,
    ) -> Result<Array2<f32>>;

    /// Backpropagates `d`, the gradient of the loss with respect to the last output.
    ///
    /// # Arguments
    /// * `params` - The model's parameters, the same used in `forward`.
    /// * `grad` - The gradient buffer, accumulated into.
    /// * `d` - The gradient of the loss with respect to the output.
    /// * `sync` - The group used to synchronize batch statistics.
    fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        d: Array2<f32>,
        sync: &mut dyn Collective,
    ) -> Result<()>;

    /// Clears every stateful layer.
    fn reset(&mut self);

    /// Returns the non trainable state (running statistics) by name.
    fn buffers(&self) -> BTreeMap<String, Vec<f32>>;

    /// Restores the non trainable state.
    fn load_buffers(&mut self, buffers: &BTreeMap<String, Vec<f32>>) -> Result<()>;
}
