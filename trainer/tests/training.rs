use std::{
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use clap::Parser;
use comms::Solo;
use machine_learning::arch::{Model, SpikingMixer};
use trainer::{
    Engine, EpochRecord, TrainErr,
    checkpoint::Checkpoint,
    cli::Args,
    config::RunConfig,
    distributed::Topology,
    run_dir::RunDir,
    run_on,
};

const TRAIN_PER_FILE: usize = 4;
const TEST_SAMPLES: usize = 10;
const IMAGE_BYTES: usize = 3 * 32 * 32;

/// Writes a tiny cifar-10 binary distribution whose images brighten with the label.
fn write_cifar(root: &Path) {
    let dir = root.join("cifar-10-batches-bin");
    fs::create_dir_all(&dir).unwrap();

    let records = |n: usize, offset: usize| -> Vec<u8> {
        (0..n)
            .flat_map(|i| {
                let label = ((i + offset) % 10) as u8;
                let mut record = vec![label];
                record.extend((0..IMAGE_BYTES).map(|p| label * 25 + (p % 7) as u8));
                record
            })
            .collect()
    };

    for i in 1..=5 {
        let file = dir.join(format!("data_batch_{i}.bin"));
        fs::write(file, records(TRAIN_PER_FILE, i)).unwrap();
    }
    fs::write(dir.join("test_batch.bin"), records(TEST_SAMPLES, 0)).unwrap();
}

fn config(data: &Path, out: &Path, flags: &[&str]) -> RunConfig {
    let data = data.to_string_lossy().into_owned();
    let out = out.to_string_lossy().into_owned();

    let defaults = [
        ("--data-path", data.as_str()),
        ("--output-dir", out.as_str()),
        ("--model", "mixer-tiny"),
        ("--image-size", "16"),
        ("--T", "2"),
        ("--batch-size", "8"),
        ("--epochs", "3"),
        ("--workers", "2"),
        ("--lr-warmup-epochs", "1"),
        ("--print-freq", "1"),
        ("--seed", "7"),
    ];

    // clap rejects repeated flags, so overrides replace the defaults
    let mut argv = vec!["snn-mixer-train"];
    for (flag, value) in defaults {
        if !flags.contains(&flag) {
            argv.extend([flag, value]);
        }
    }
    argv.extend_from_slice(flags);

    let command_line = argv.iter().map(|s| s.to_string()).collect();
    RunConfig::from_args(Args::try_parse_from(&argv).unwrap(), command_line).unwrap()
}

fn load(path: &Path, config: &RunConfig) -> Checkpoint {
    let mut mixer = config.mixer_config().unwrap();
    mixer.num_classes = 10;
    let model = SpikingMixer::new(mixer).unwrap();
    Checkpoint::load(path, model.layout()).unwrap()
}

fn epochs(records: &[EpochRecord]) -> Vec<usize> {
    records.iter().map(|r| r.epoch).collect()
}

fn event_files(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| {
            p.file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("events.out.tfevents.")
        })
        .collect()
}

#[test]
fn end_to_end_run_writes_checkpoints_events_and_args() {
    let tmp = tempfile::tempdir().unwrap();
    write_cifar(tmp.path());
    let config = config(tmp.path(), &tmp.path().join("logs"), &[]);

    let records = run_on(config.clone(), Topology::Single).unwrap();
    assert_eq!(epochs(&records), [0, 1, 2]);
    for r in &records {
        assert!(r.train.loss.is_finite() && r.test.loss.is_finite());
        assert!((0. ..=100.).contains(&r.test.acc1));
        assert!(r.test.acc5 >= r.test.acc1);
    }

    let dir = RunDir::new(&config);
    assert!(dir.root().join("args.txt").is_file());
    assert_eq!(event_files(&dir.tb()).len(), 1);

    let latest = load(&dir.latest_checkpoint(), &config);
    assert_eq!(latest.epoch, 2);
    assert_eq!(latest.lr_scheduler.last_epoch, 3);
    // 20 samples in batches of 8, three epochs
    assert_eq!(latest.optimizer.steps, 9);
    assert_eq!(latest.args, config);
    assert!(latest.scaler.is_none());
    assert!(!latest.buffers.is_empty());
}

#[test]
fn best_checkpoint_only_moves_on_strict_improvement() {
    let tmp = tempfile::tempdir().unwrap();
    write_cifar(tmp.path());
    let config = config(tmp.path(), &tmp.path().join("logs"), &["--epochs", "4"]);

    let records = run_on(config.clone(), Topology::Single).unwrap();
    let best_acc = records.iter().map(|r| r.test.acc1).fold(f64::MIN, f64::max);
    let first_best = records.iter().find(|r| r.test.acc1 == best_acc).unwrap().epoch;

    let dir = RunDir::new(&config);
    let best = load(&dir.best_checkpoint(), &config);
    assert_eq!(best.epoch, first_best);
    assert_eq!(best.max_test_acc1, best_acc);
    assert_eq!(load(&dir.latest_checkpoint(), &config).max_test_acc1, best_acc);
}

#[test]
fn resuming_neither_repeats_nor_skips_epochs() {
    let tmp = tempfile::tempdir().unwrap();
    write_cifar(tmp.path());

    let first = config(tmp.path(), &tmp.path().join("first"), &["--epochs", "2"]);
    assert_eq!(epochs(&run_on(first.clone(), Topology::Single).unwrap()), [0, 1]);

    let checkpoint = RunDir::new(&first).latest_checkpoint();
    let checkpoint = checkpoint.to_string_lossy().into_owned();
    let second = config(
        tmp.path(),
        &tmp.path().join("second"),
        &["--epochs", "4", "--resume", checkpoint.as_str()],
    );

    let mut engine = Engine::new(second.clone(), Box::new(Solo)).unwrap();
    let schedule = second.schedule_spec().build().unwrap();
    assert_eq!(engine.lr(), schedule.lr(second.lr, 2));

    let records = engine.run().unwrap();
    assert_eq!(epochs(&records), [2, 3]);
    assert_eq!(records[0].lr, schedule.lr(second.lr, 2));

    let latest = load(&RunDir::new(&second).latest_checkpoint(), &second);
    assert_eq!(latest.epoch, 3);
    assert_eq!(latest.lr_scheduler.last_epoch, 4);
    assert_eq!(latest.optimizer.steps, 12);
}

#[test]
fn resuming_latest_restores_progress_and_best_accuracy() {
    let tmp = tempfile::tempdir().unwrap();
    write_cifar(tmp.path());
    let out = tmp.path().join("logs");

    let fresh = config(tmp.path(), &out, &[]);
    run_on(fresh.clone(), Topology::Single).unwrap();
    let saved = load(&RunDir::new(&fresh).latest_checkpoint(), &fresh);

    let resumed = config(tmp.path(), &out, &["--resume", "latest"]);
    let mut engine = Engine::new(resumed, Box::new(Solo)).unwrap();

    assert_eq!(engine.start_epoch(), 3);
    assert_eq!(engine.max_test_acc1(), saved.max_test_acc1);
    assert!(engine.run().unwrap().is_empty());

    // the resumed session opened a second event file with a purge marker
    assert_eq!(event_files(&RunDir::new(&fresh).tb()).len(), 2);
}

#[test]
fn fresh_run_refuses_an_existing_run_directory() {
    let tmp = tempfile::tempdir().unwrap();
    write_cifar(tmp.path());
    let config = config(tmp.path(), &tmp.path().join("logs"), &["--epochs", "1"]);

    run_on(config.clone(), Topology::Single).unwrap();
    assert!(matches!(
        run_on(config, Topology::Single),
        Err(TrainErr::InvalidConfig(_))
    ));
}

#[test]
fn missing_dataset_fails_before_training() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config(tmp.path(), &tmp.path().join("logs"), &[]);

    assert!(run_on(config.clone(), Topology::Single).is_err());
    assert!(!RunDir::new(&config).root().exists());
}

#[test]
fn thread_ranks_train_with_synchronized_batch_norm() {
    let tmp = tempfile::tempdir().unwrap();
    write_cifar(tmp.path());
    let config = config(
        tmp.path(),
        &tmp.path().join("logs"),
        &["--world-size", "2", "--dist-url", "local://", "--sync-bn", "--epochs", "2"],
    );

    let topology = Topology::Threads(NonZeroUsize::new(2).unwrap());
    let records = run_on(config.clone(), topology).unwrap();
    assert_eq!(epochs(&records), [0, 1]);

    let latest = load(&RunDir::new(&config).latest_checkpoint(), &config);
    // each rank sees 10 of the 20 samples, two batches per epoch
    assert_eq!(latest.optimizer.steps, 4);
}

#[test]
fn amp_runs_checkpoint_the_scaler() {
    let tmp = tempfile::tempdir().unwrap();
    write_cifar(tmp.path());
    let config = config(
        tmp.path(),
        &tmp.path().join("logs"),
        &["--amp", "--clip-grad-norm", "1.0", "--epochs", "1"],
    );

    let records = run_on(config.clone(), Topology::Single).unwrap();
    assert_eq!(records.len(), 1);

    let latest = load(&RunDir::new(&config).latest_checkpoint(), &config);
    let scaler = latest.scaler.unwrap();
    assert!(scaler.scale > 0. && scaler.scale <= 65536.);
}

#[test]
fn uneven_shards_pad_the_evaluation() {
    let tmp = tempfile::tempdir().unwrap();
    write_cifar(tmp.path());
    let config = config(
        tmp.path(),
        &tmp.path().join("logs"),
        &["--world-size", "3", "--dist-url", "local://", "--epochs", "1"],
    );

    let topology = Topology::Threads(NonZeroUsize::new(3).unwrap());
    let records = run_on(config, topology).unwrap();
    // 10 test samples over 3 ranks, 4 each
    assert_eq!(records[0].evaluated, 12);
}

#[test]
fn even_shards_evaluate_every_sample_once() {
    let tmp = tempfile::tempdir().unwrap();
    write_cifar(tmp.path());
    let config = config(tmp.path(), &tmp.path().join("logs"), &["--epochs", "1"]);

    let records = run_on(config, Topology::Single).unwrap();
    assert_eq!(records[0].evaluated, TEST_SAMPLES);
}

#[test]
fn coordinator_io_failure_ends_every_thread_rank() {
    let tmp = tempfile::tempdir().unwrap();
    write_cifar(tmp.path());
    let out = tmp.path().join("logs");
    let threads = ["--world-size", "2", "--dist-url", "local://"];
    let topology = Topology::Threads(NonZeroUsize::new(2).unwrap());

    let first = config(tmp.path(), &out, &[&threads[..], &["--epochs", "1"][..]].concat());
    run_on(first.clone(), topology.clone()).unwrap();

    // a directory where the checkpoint is staged makes the coordinator's save
    // fail while the other rank moves on to the next epoch
    let staged = RunDir::new(&first).pt().join("checkpoint_latest.pth.tmp");
    fs::create_dir(&staged).unwrap();

    let resumed = config(
        tmp.path(),
        &out,
        &[&threads[..], &["--epochs", "3", "--resume", "latest"][..]].concat(),
    );
    assert!(matches!(run_on(resumed, topology), Err(TrainErr::Io(_))));
}
