use std::collections::BTreeMap;

use comms::Collective;
use log::debug;
use ndarray::prelude::*;
use rand::RngCore;

use super::{
    MixerConfig, Model, ParamLayout,
    layers::{BatchNorm, Lif, Linear},
};
use crate::{MlErr, Result};

/// `Linear → BatchNorm → Lif → Linear → BatchNorm → Lif`.
struct MlpBranch {
    fc1: Linear,
    bn1: BatchNorm,
    lif1: Lif,
    fc2: Linear,
    bn2: BatchNorm,
    lif2: Lif,
}

impl MlpBranch {
    fn new(layout: &mut ParamLayout, prefix: &str, dim: usize, hidden: usize) -> Self {
        Self {
            fc1: Linear::new(layout, &format!("{prefix}.fc1"), (dim, hidden)),
            bn1: BatchNorm::new(layout, &format!("{prefix}.bn1"), hidden),
            lif1: Lif::new(hidden),
            fc2: Linear::new(layout, &format!("{prefix}.fc2"), (hidden, dim)),
            bn2: BatchNorm::new(layout, &format!("{prefix}.bn2"), dim),
            lif2: Lif::new(dim),
        }
    }

    fn init(&self, params: &mut [f32], rng: &mut dyn RngCore) -> Result<()> {
        self.fc1.init(params, rng)?;
        self.bn1.init(params);
        self.fc2.init(params, rng)?;
        self.bn2.init(params);
        Ok(())
    }

    fn set_train(&mut self, train: bool) {
        self.bn1.set_train(train);
        self.lif1.set_train(train);
        self.bn2.set_train(train);
        self.lif2.set_train(train);
    }

    fn forward(
        &mut self,
        params: &[f32],
        x: Array2<f32>,
        steps: usize,
        sync: &mut dyn Collective,
    ) -> Result<Array2<f32>> {
        let x = self.fc1.forward(params, x)?;
        let x = self.bn1.forward(params, x, sync)?;
        let x = self.lif1.forward(x, steps)?;
        let x = self.fc2.forward(params, x)?;
        let x = self.bn2.forward(params, x, sync)?;
        self.lif2.forward(x, steps)
    }

    fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        d: Array2<f32>,
        sync: &mut dyn Collective,
    ) -> Result<Array2<f32>> {
        let d = self.lif2.backward(d)?;
        let d = self.bn2.backward(params, grad, d, sync)?;
        let d = self.fc2.backward(params, grad, d)?;
        let d = self.lif1.backward(d)?;
        let d = self.bn1.backward(params, grad, d, sync)?;
        self.fc1.backward(params, grad, d)
    }

    fn reset(&mut self) {
        self.lif1.reset();
        self.lif2.reset();
    }

    fn buffers(&self, out: &mut BTreeMap<String, Vec<f32>>) {
        self.bn1.buffers(out);
        self.bn2.buffers(out);
    }

    fn load_buffers(&mut self, buffers: &BTreeMap<String, Vec<f32>>) -> Result<()> {
        self.bn1.load_buffers(buffers)?;
        self.bn2.load_buffers(buffers)
    }
}

/// Token mixing across patches followed by channel mixing, both residual.
struct MixerBlock {
    token_mlp: MlpBranch,
    channel_mlp: MlpBranch,
}

/// An MLP-Mixer whose activations are leaky integrate-and-fire neurons.
///
/// Inputs are flattened `C×S×S` images stacked time-major, `steps` blocks of
/// `batch` rows. The outputs are the head's logits with the same row order.
pub struct SpikingMixer {
    config: MixerConfig,
    layout: ParamLayout,
    embed: Linear,
    blocks: Vec<MixerBlock>,
    head: Linear,
}

impl SpikingMixer {
    /// Creates a new `SpikingMixer` and its parameter layout.
    pub fn new(config: MixerConfig) -> Result<Self> {
        config.validate()?;

        let mut layout = ParamLayout::new();
        let patches = config.num_patches();
        let hidden = config.hidden_dim;

        let embed = Linear::new(&mut layout, "embed", (config.patch_dim(), hidden));
        let blocks = (0..config.num_blocks)
            .map(|i| MixerBlock {
                token_mlp: MlpBranch::new(
                    &mut layout,
                    &format!("blocks.{i}.token_mlp"),
                    patches,
                    config.tokens_mlp_dim,
                ),
                channel_mlp: MlpBranch::new(
                    &mut layout,
                    &format!("blocks.{i}.channel_mlp"),
                    hidden,
                    config.channels_mlp_dim,
                ),
            })
            .collect();
        let head = Linear::new(&mut layout, "head", (hidden, config.num_classes));

        debug!(params = layout.size(), blocks = config.num_blocks; "built spiking mixer");

        Ok(Self {
            config,
            layout,
            embed,
            blocks,
            head,
        })
    }

    pub fn config(&self) -> &MixerConfig {
        &self.config
    }

    /// Splits every image into its non overlapping patches, one row per patch.
    fn patchify(&self, x: ArrayView2<f32>) -> Result<Array2<f32>> {
        let c = &self.config;
        let (n, side, p) = (x.nrows(), c.patches_per_side(), c.patch_size);

        let patches = x
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order([n, c.channels, side, p, side, p])?
            .permuted_axes([0, 2, 4, 1, 3, 5])
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((n * c.num_patches(), c.patch_dim()))?;

        Ok(patches)
    }
}

/// Turns `(n·a, b)` rows into `(n·b, a)` rows by swapping the two inner axes.
fn swap_inner(x: Array2<f32>, n: usize, a: usize, b: usize) -> Result<Array2<f32>> {
    let swapped = x
        .into_shape_with_order((n, a, b))?
        .permuted_axes([0, 2, 1])
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((n * b, a))?;

    Ok(swapped)
}

impl Model for SpikingMixer {
    fn layout(&self) -> &ParamLayout {
        &self.layout
    }

    fn init_params(&self, rng: &mut dyn RngCore) -> Result<Vec<f32>> {
        let mut params = vec![0.; self.layout.size()];

        self.embed.init(&mut params, rng)?;
        for block in &self.blocks {
            block.token_mlp.init(&mut params, rng)?;
            block.channel_mlp.init(&mut params, rng)?;
        }
        self.head.init(&mut params, rng)?;

        Ok(params)
    }

    fn set_train(&mut self, train: bool) {
        for block in &mut self.blocks {
            block.token_mlp.set_train(train);
            block.channel_mlp.set_train(train);
        }
    }

    fn forward(
        &mut self,
        params: &[f32],
        x: ArrayView2<'_, f32>,
        steps: usize,
        sync: &mut dyn Collective,
    ) -> Result<Array2<f32>> {
        if params.len() != self.layout.size() {
            return Err(MlErr::SizeMismatch {
                what: "model parameters",
                got: params.len(),
                expected: self.layout.size(),
            });
        }
        if x.ncols() != self.config.input_dim() {
            return Err(MlErr::SizeMismatch {
                what: "model input features",
                got: x.ncols(),
                expected: self.config.input_dim(),
            });
        }

        let n = x.nrows();
        let (p, d) = (self.config.num_patches(), self.config.hidden_dim);

        let mut u = self.embed.forward(params, self.patchify(x)?)?;

        for block in &mut self.blocks {
            let tokens = swap_inner(u.clone(), n, p, d)?;
            let mixed = block.token_mlp.forward(params, tokens, steps, sync)?;
            u += &swap_inner(mixed, n, d, p)?;

            let mixed = block.channel_mlp.forward(params, u.clone(), steps, sync)?;
            u += &mixed;
        }

        let pooled = u
            .into_shape_with_order((n, p, d))?
            .mean_axis(Axis(1))
            .ok_or(MlErr::SizeMismatch {
                what: "model patches",
                got: 0,
                expected: p,
            })?;

        self.head.forward(params, pooled)
    }

    fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        d: Array2<f32>,
        sync: &mut dyn Collective,
    ) -> Result<()> {
        if grad.len() != self.layout.size() {
            return Err(MlErr::SizeMismatch {
                what: "model gradient",
                got: grad.len(),
                expected: self.layout.size(),
            });
        }

        let n = d.nrows();
        let (p, dim) = (self.config.num_patches(), self.config.hidden_dim);

        let d_pooled = self.head.backward(params, grad, d)? / p as f32;
        let mut du = Array2::from_shape_fn((n * p, dim), |(r, j)| d_pooled[[r / p, j]]);

        for block in self.blocks.iter_mut().rev() {
            let d_mixed = block.channel_mlp.backward(params, grad, du.clone(), sync)?;
            du += &d_mixed;

            let d_tokens = swap_inner(du.clone(), n, p, dim)?;
            let d_mixed = block.token_mlp.backward(params, grad, d_tokens, sync)?;
            du += &swap_inner(d_mixed, n, dim, p)?;
        }

        self.embed.backward(params, grad, du)?;
        Ok(())
    }

    fn reset(&mut self) {
        for block in &mut self.blocks {
            block.token_mlp.reset();
            block.channel_mlp.reset();
        }
    }

    fn buffers(&self) -> BTreeMap<String, Vec<f32>> {
        let mut out = BTreeMap::new();
        for block in &self.blocks {
            block.token_mlp.buffers(&mut out);
            block.channel_mlp.buffers(&mut out);
        }
        out
    }

    fn load_buffers(&mut self, buffers: &BTreeMap<String, Vec<f32>>) -> Result<()> {
        for block in &mut self.blocks {
            block.token_mlp.load_buffers(buffers)?;
            block.channel_mlp.load_buffers(buffers)?;
        }
        Ok(())
    }
}
