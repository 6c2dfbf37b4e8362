use serde::{Deserialize, Serialize};

use crate::{MlErr, Result};

/// The shape of a spiking MLP-Mixer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixerConfig {
    pub image_size: usize,
    pub channels: usize,
    pub patch_size: usize,
    pub hidden_dim: usize,
    pub tokens_mlp_dim: usize,
    pub channels_mlp_dim: usize,
    pub num_blocks: usize,
    pub num_classes: usize,
}

impl MixerConfig {
    /// Resolves a registered model name into its configuration.
    ///
    /// # Arguments
    /// * `name` - One of `mixer` or `mixer-tiny`.
    /// * `image_size` - The side of the square input images.
    ///
    /// # Returns
    /// The validated configuration, or an `InvalidConfig` error for unknown
    /// names and image sizes the patches don't tile.
    pub fn named(name: &str, image_size: usize) -> Result<Self> {
        let (patch_size, hidden_dim, tokens_mlp_dim, channels_mlp_dim, num_blocks) = match name {
            "mixer" => (4, 128, 64, 512, 4),
            "mixer-tiny" => (8, 16, 8, 32, 1),
            other => {
                return Err(MlErr::InvalidConfig(format!("unknown model {other}")));
            }
        };

        let config = Self {
            image_size,
            channels: 3,
            patch_size,
            hidden_dim,
            tokens_mlp_dim,
            channels_mlp_dim,
            num_blocks,
            num_classes: 10,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let dims = [
            ("image_size", self.image_size),
            ("channels", self.channels),
            ("patch_size", self.patch_size),
            ("hidden_dim", self.hidden_dim),
            ("tokens_mlp_dim", self.tokens_mlp_dim),
            ("channels_mlp_dim", self.channels_mlp_dim),
            ("num_classes", self.num_classes),
        ];

        if let Some((what, _)) = dims.iter().find(|(_, v)| *v == 0) {
            return Err(MlErr::InvalidConfig(format!("{what} must be positive")));
        }

        if self.image_size % self.patch_size != 0 {
            return Err(MlErr::InvalidConfig(format!(
                "image size {} is not a multiple of the patch size {}",
                self.image_size, self.patch_size
            )));
        }

        Ok(())
    }

    /// The amount of patches along one side of the image.
    pub fn patches_per_side(&self) -> usize {
        self.image_size / self.patch_size
    }

    /// The amount of patches (tokens) per image.
    pub fn num_patches(&self) -> usize {
        self.patches_per_side().pow(2)
    }

    /// The amount of values in one patch.
    pub fn patch_dim(&self) -> usize {
        self.channels * self.patch_size.pow(2)
    }

    /// The amount of values in one flattened input image.
    pub fn input_dim(&self) -> usize {
        self.channels * self.image_size.pow(2)
    }
}
