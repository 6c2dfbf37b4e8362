use std::{
    fs, io,
    path::{Path, PathBuf},
};

use crate::{Result, TrainErr, config::RunConfig};

pub const LATEST_CHECKPOINT: &str = "checkpoint_latest.pth";
pub const BEST_CHECKPOINT: &str = "checkpoint_max_test_acc1.pth";

/// The directory tree a run writes into,
/// `output_dir/<run name>/{pt, tb, args.txt}`.
#[derive(Debug, Clone)]
pub struct RunDir {
    root: PathBuf,
}

impl RunDir {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            root: config.output_dir.join(config.run_name()),
        }
    }

    /// Creates the run's directories.
    ///
    /// # Arguments
    /// * `resuming` - Whether existing `pt` and `tb` directories may be reused.
    ///
    /// # Returns
    /// An `InvalidConfig` error if a fresh run would overwrite an older one.
    pub fn create(&self, resuming: bool) -> Result<()> {
        fs::create_dir_all(&self.root)?;

        for dir in [self.pt(), self.tb()] {
            match fs::create_dir(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && resuming => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    return Err(TrainErr::InvalidConfig(format!(
                        "{} already exists, pass --resume to continue that run",
                        dir.display()
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pt(&self) -> PathBuf {
        self.root.join("pt")
    }

    pub fn tb(&self) -> PathBuf {
        self.root.join("tb")
    }

    pub fn latest_checkpoint(&self) -> PathBuf {
        self.pt().join(LATEST_CHECKPOINT)
    }

    pub fn best_checkpoint(&self) -> PathBuf {
        self.pt().join(BEST_CHECKPOINT)
    }

    /// Writes the config as json followed by the command line to `args.txt`.
    pub fn write_args(&self, config: &RunConfig) -> Result<()> {
        let mut text = serde_json::to_string_pretty(config)?;
        text.push('\n');
        text.push_str(&config.command_line.join(" "));
        text.push('\n');

        fs::write(self.root.join("args.txt"), text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::cli::Args;

    fn config(output_dir: &Path) -> RunConfig {
        let out = output_dir.to_string_lossy().into_owned();
        let argv = ["snn-mixer-train", "--output-dir", &out, "--epochs", "5", "--lr-warmup-epochs", "0"];
        let command_line = argv.iter().map(|s| s.to_string()).collect();
        RunConfig::from_args(Args::try_parse_from(argv).unwrap(), command_line).unwrap()
    }

    #[test]
    fn fresh_runs_refuse_existing_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        let dir = RunDir::new(&config);

        dir.create(false).unwrap();
        assert!(dir.pt().is_dir() && dir.tb().is_dir());
        assert!(dir.root().ends_with("mixer_b32_e5_sgd_lr0.1_wd0.0_seed42"));

        assert!(matches!(dir.create(false), Err(TrainErr::InvalidConfig(_))));
        dir.create(true).unwrap();
    }

    #[test]
    fn args_file_holds_config_and_command_line() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        let dir = RunDir::new(&config);
        dir.create(false).unwrap();
        dir.write_args(&config).unwrap();

        let text = fs::read_to_string(dir.root().join("args.txt")).unwrap();
        let (json, command_line) = text.trim_end().rsplit_once('\n').unwrap();

        assert_eq!(serde_json::from_str::<RunConfig>(json).unwrap(), config);
        assert!(command_line.starts_with("snn-mixer-train --output-dir"));
    }
}
