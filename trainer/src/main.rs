use std::{env, io};

use clap::Parser;
use log::info;
use trainer::{cli::Args, config::RunConfig};

fn main() -> io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = RunConfig::from_args(args, env::args().collect())?;
    info!(run = config.run_name().as_str(); "starting run");

    let records = trainer::run(config)?;
    if let Some(last) = records.last() {
        info!(
            epoch = last.epoch, test_acc1 = last.test.acc1;
            "training finished"
        );
    }

    Ok(())
}
