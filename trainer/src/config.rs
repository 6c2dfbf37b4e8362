use std::{
    fmt::{self, Display},
    num::NonZeroUsize,
    path::PathBuf,
    str::FromStr,
};

use machine_learning::{
    arch::MixerConfig,
    optimization::{OptimizerKind, OptimizerSpec},
    schedule::{ScheduleSpec, SchedulerKind, WarmupMethod},
};
use serde::{Deserialize, Serialize};

use crate::{Result, TrainErr, cli::Args};

/// Where the ranks of a distributed run meet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistUrl {
    /// `env://`, the rendezvous comes from `MASTER_ADDR` and `MASTER_PORT`.
    Env,
    /// `tcp://host:port`.
    Tcp(String),
    /// `local://`, every rank is a thread of this process.
    Local,
}

impl FromStr for DistUrl {
    type Err = TrainErr;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once("://") {
            Some(("env", "")) => Ok(Self::Env),
            Some(("local", "")) => Ok(Self::Local),
            Some(("tcp", addr)) if addr.contains(':') => Ok(Self::Tcp(addr.to_string())),
            _ => Err(TrainErr::InvalidConfig(format!(
                "unsupported dist url {s}, expected env://, tcp://host:port or local://"
            ))),
        }
    }
}

impl Display for DistUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Env => write!(f, "env://"),
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Local => write!(f, "local://"),
        }
    }
}

/// The validated, immutable hyperparameters of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub data_path: PathBuf,
    pub model: String,
    pub steps: usize,
    pub device: String,
    pub batch_size: usize,
    pub epochs: usize,
    pub workers: usize,
    pub opt: OptimizerKind,
    pub lr: f32,
    pub momentum: f32,
    pub weight_decay: f32,
    pub lr_scheduler: SchedulerKind,
    pub lr_warmup_epochs: usize,
    pub lr_warmup_method: WarmupMethod,
    pub lr_warmup_decay: f32,
    pub lr_step_size: usize,
    pub lr_gamma: f32,
    pub output_dir: PathBuf,
    pub resume: Option<String>,
    pub start_epoch: usize,
    pub world_size: NonZeroUsize,
    pub dist_url: DistUrl,
    pub seed: u64,
    pub amp: bool,
    pub clip_grad_norm: Option<f32>,
    pub local_rank: Option<usize>,
    pub sync_bn: bool,
    pub print_freq: usize,
    pub image_size: usize,
    /// The command line the run was started with.
    #[serde(default)]
    pub command_line: Vec<String>,
}

impl RunConfig {
    /// Validates the parsed arguments and freezes them into a `RunConfig`.
    ///
    /// # Arguments
    /// * `args` - The parsed command line flags.
    /// * `command_line` - The raw command line, kept for `args.txt`.
    ///
    /// # Returns
    /// The config, or an `InvalidConfig` error naming the first bad flag.
    pub fn from_args(args: Args, command_line: Vec<String>) -> Result<Self> {
        let invalid = |msg: String| Err(TrainErr::InvalidConfig(msg));

        if args.device != "cpu" {
            return invalid(format!("unsupported device {}, only cpu is available", args.device));
        }
        for (flag, value) in [
            ("--T", args.steps),
            ("--batch-size", args.batch_size),
            ("--epochs", args.epochs),
        ] {
            if value == 0 {
                return invalid(format!("{flag} must be positive"));
            }
        }
        if args.start_epoch > args.epochs {
            return invalid(format!(
                "--start-epoch {} is past --epochs {}",
                args.start_epoch, args.epochs
            ));
        }
        if !(args.lr > 0.) {
            return invalid(format!("--lr must be positive, got {}", args.lr));
        }
        if let Some(max_norm) = args.clip_grad_norm.filter(|m| !(*m > 0.)) {
            return invalid(format!("--clip-grad-norm must be positive, got {max_norm}"));
        }
        let Some(world_size) = NonZeroUsize::new(args.world_size) else {
            return invalid("--world-size must be positive".into());
        };

        let config = Self {
            data_path: args.data_path,
            model: args.model,
            steps: args.steps,
            device: args.device,
            batch_size: args.batch_size,
            epochs: args.epochs,
            workers: args.workers,
            opt: args.opt.parse()?,
            lr: args.lr,
            momentum: args.momentum,
            weight_decay: args.weight_decay,
            lr_scheduler: args.lr_scheduler.parse()?,
            lr_warmup_epochs: args.lr_warmup_epochs,
            lr_warmup_method: args.lr_warmup_method.parse()?,
            lr_warmup_decay: args.lr_warmup_decay,
            lr_step_size: args.lr_step_size,
            lr_gamma: args.lr_gamma,
            output_dir: args.output_dir,
            resume: args.resume,
            start_epoch: args.start_epoch,
            world_size,
            dist_url: args.dist_url.parse()?,
            seed: args.seed,
            amp: args.amp,
            clip_grad_norm: args.clip_grad_norm,
            local_rank: args.local_rank,
            sync_bn: args.sync_bn,
            print_freq: args.print_freq,
            image_size: args.image_size,
            command_line,
        };

        // Resolve everything that is built later so bad names fail now.
        config.mixer_config()?;
        config.schedule_spec().build()?;

        Ok(config)
    }

    pub fn mixer_config(&self) -> Result<MixerConfig> {
        Ok(MixerConfig::named(&self.model, self.image_size)?)
    }

    pub fn optimizer_spec(&self) -> OptimizerSpec {
        OptimizerSpec {
            kind: self.opt,
            lr: self.lr,
            momentum: self.momentum,
            weight_decay: self.weight_decay,
        }
    }

    pub fn schedule_spec(&self) -> ScheduleSpec {
        ScheduleSpec {
            kind: self.lr_scheduler,
            epochs: self.epochs,
            step_size: self.lr_step_size,
            gamma: self.lr_gamma,
            warmup_epochs: self.lr_warmup_epochs,
            warmup_method: self.lr_warmup_method,
            warmup_decay: self.lr_warmup_decay,
        }
    }

    /// `<model>_b<batch>_e<epochs>_<opt>_lr<lr>_wd<wd>_seed<seed>`.
    pub fn run_name(&self) -> String {
        format!(
            "{}_b{}_e{}_{}_lr{}_wd{}_seed{}",
            self.model,
            self.batch_size,
            self.epochs,
            self.opt,
            float_name(self.lr),
            float_name(self.weight_decay),
            self.seed
        )
    }
}

/// Formats `x` the way Python's `repr` does, so run names stay stable.
///
/// Exponents below -4 or from 16 up switch to scientific notation with a signed
/// two digit exponent, whole numbers keep a trailing `.0`.
fn float_name(x: f32) -> String {
    let sci = format!("{x:e}");
    let scientific = sci
        .split_once('e')
        .and_then(|(mantissa, exp)| Some((mantissa, exp.parse::<i32>().ok()?)))
        .filter(|&(_, exp)| x.is_finite() && x != 0. && !(-4..16).contains(&exp));

    if let Some((mantissa, exp)) = scientific {
        let sign = if exp < 0 { '-' } else { '+' };
        return format!("{mantissa}e{sign}{:02}", exp.abs());
    }

    if x.fract() == 0. && x.is_finite() {
        format!("{x:.1}")
    } else {
        format!("{x}")
    }
}
