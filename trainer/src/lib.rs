pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod distributed;
pub mod engine;
mod error;
pub mod run_dir;
pub mod tensorboard;

use std::env;

pub use engine::{Engine, EpochRecord, EpochResult};
pub use error::{Result, TrainErr};

use config::RunConfig;
use distributed::Topology;

/// Trains a run to completion on the topology the environment describes.
///
/// # Returns
/// The coordinator's per-epoch results.
pub fn run(config: RunConfig) -> Result<Vec<EpochRecord>> {
    let topology = Topology::from_env(&config, |name| env::var(name).ok())?;
    run_on(config, topology)
}

/// Same as `run` with an explicit topology.
pub fn run_on(config: RunConfig, topology: Topology) -> Result<Vec<EpochRecord>> {
    topology.launch(|sync| Engine::new(config.clone(), sync)?.run())
}
