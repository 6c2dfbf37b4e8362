use std::path::PathBuf;

use clap::Parser;

/// Train a spiking MLP-Mixer on CIFAR-10.
#[derive(Parser, Debug, Clone)]
#[command(name = "snn-mixer-train", version)]
pub struct Args {
    /// Directory holding `cifar-10-batches-bin` (or the batch files themselves).
    #[arg(long, default_value = "./data")]
    pub data_path: PathBuf,
    /// Registered model configuration, `mixer` or `mixer-tiny`.
    #[arg(long, default_value = "mixer")]
    pub model: String,
    /// Simulated time steps per sample.
    #[arg(long = "T", default_value_t = 4)]
    pub steps: usize,
    /// Compute device, only `cpu` is available.
    #[arg(long, default_value = "cpu")]
    pub device: String,
    #[arg(long, default_value_t = 32)]
    pub batch_size: usize,
    #[arg(long, default_value_t = 90)]
    pub epochs: usize,
    /// Threads used to decode and augment samples.
    #[arg(long, default_value_t = 16)]
    pub workers: usize,
    /// `sgd` or `adamw`.
    #[arg(long, default_value = "sgd")]
    pub opt: String,
    #[arg(long, default_value_t = 0.1)]
    pub lr: f32,
    #[arg(long, default_value_t = 0.9)]
    pub momentum: f32,
    #[arg(long, default_value_t = 0.)]
    pub weight_decay: f32,
    /// `step`, `cosa` or `exp`.
    #[arg(long, default_value = "cosa")]
    pub lr_scheduler: String,
    #[arg(long, default_value_t = 10)]
    pub lr_warmup_epochs: usize,
    /// `linear` or `constant`.
    #[arg(long, default_value = "linear")]
    pub lr_warmup_method: String,
    #[arg(long, default_value_t = 0.01)]
    pub lr_warmup_decay: f32,
    #[arg(long, default_value_t = 30)]
    pub lr_step_size: usize,
    #[arg(long, default_value_t = 0.1)]
    pub lr_gamma: f32,
    #[arg(long, default_value = "./logs")]
    pub output_dir: PathBuf,
    /// `latest` or the path of a checkpoint to resume from.
    #[arg(long)]
    pub resume: Option<String>,
    #[arg(long, default_value_t = 0)]
    pub start_epoch: usize,
    /// Amount of ranks, used with `--dist-url local://`.
    #[arg(long, default_value_t = 1)]
    pub world_size: usize,
    /// `env://`, `tcp://host:port` or `local://`.
    #[arg(long, default_value = "env://")]
    pub dist_url: String,
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
    /// Scale the loss and keep gradients at half precision.
    #[arg(long)]
    pub amp: bool,
    #[arg(long)]
    pub clip_grad_norm: Option<f32>,
    #[arg(long)]
    pub local_rank: Option<usize>,
    /// Reduce batch norm statistics across ranks.
    #[arg(long)]
    pub sync_bn: bool,
    /// Batches between progress reports, 0 disables them.
    #[arg(long, default_value_t = 100)]
    pub print_freq: usize,
    /// Side of the square images fed to the model.
    #[arg(long, default_value_t = 32)]
    pub image_size: usize,
}
