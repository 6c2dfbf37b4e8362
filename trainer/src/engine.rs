use std::{
    num::NonZeroUsize,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use comms::{Collective, Solo};
use log::{info, warn};
use machine_learning::{
    arch::{
        Model, SpikingMixer,
        loss::{LossFn, Mse, one_hot},
    },
    data::{Cifar10, DataLoader, Pipeline, Sampler, ShardSpec, sample_seed},
    encoding::{PoissonEncoder, mean_over_steps, repeat_steps, spread_over_steps},
    metrics::{MetricLogger, SmoothedValue, ValueFormat, accuracy},
    optimization::{Optimizer, clip_grad_norm},
    scaler::GradScaler,
    schedule::LrScheduler,
};
use rand::{SeedableRng, rngs::StdRng};

use crate::{
    Result, TrainErr, checkpoint::Checkpoint, config::RunConfig, run_dir::RunDir,
    tensorboard::EventWriter,
};

const TOPK: [usize; 2] = [1, 5];

/// The averaged metrics of one phase of an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EpochResult {
    pub loss: f64,
    pub acc1: f64,
    pub acc5: f64,
}

/// What an epoch produced, as seen by every rank.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train: EpochResult,
    pub test: EpochResult,
    /// The learning rate the epoch trained with.
    pub lr: f32,
    /// Test samples evaluated over every rank, padding included.
    pub evaluated: usize,
}

/// I/O only the coordinator performs.
struct Outputs {
    run_dir: RunDir,
    events: EventWriter,
}

/// Trains and evaluates one rank's replica of the model.
pub struct Engine {
    config: RunConfig,
    sync: Box<dyn Collective>,

    model: SpikingMixer,
    params: Vec<f32>,
    grad: Vec<f32>,
    optimizer: Box<dyn Optimizer>,
    scheduler: LrScheduler,
    scaler: Option<GradScaler>,
    loss_fn: Mse,
    encoder: PoissonEncoder,

    train_loader: DataLoader,
    test_loader: DataLoader,
    num_classes: usize,

    start_epoch: usize,
    max_test_acc1: f64,
    outputs: Option<Outputs>,
}

impl Engine {
    /// Sets up one rank: data, model, optimizer, schedule and, when resuming,
    /// the state of the last completed epoch.
    ///
    /// # Arguments
    /// * `config` - The run's configuration.
    /// * `sync` - This rank's handle to the process group.
    ///
    /// # Returns
    /// The engine ready to `run`, or the first setup error.
    pub fn new(config: RunConfig, mut sync: Box<dyn Collective>) -> Result<Self> {
        let rank = sync.rank();
        let world_size = sync.world_size();

        let train_set = Arc::new(Cifar10::load(&config.data_path, true)?);
        let test_set = Arc::new(Cifar10::load(&config.data_path, false)?);

        let distributed = NonZeroUsize::new(world_size).filter(|n| n.get() > 1);
        let (train_sampler, test_sampler) = match distributed {
            Some(world) => {
                let shard = ShardSpec::new(rank, world)?;
                (
                    Sampler::distributed(shard, true, config.seed),
                    Sampler::distributed(shard, false, config.seed),
                )
            }
            None => (Sampler::random(config.seed), Sampler::Sequential),
        };

        let train_loader = DataLoader::new(
            train_set,
            Pipeline::cifar10_train(config.image_size),
            train_sampler,
            config.batch_size,
            config.workers,
            config.seed,
        )?;
        let test_loader = DataLoader::new(
            Arc::clone(&test_set),
            Pipeline::cifar10_test(config.image_size),
            test_sampler,
            config.batch_size,
            config.workers,
            config.seed,
        )?;

        let mut mixer_config = config.mixer_config()?;
        mixer_config.num_classes = test_set.classes().len();
        let num_classes = mixer_config.num_classes;
        let mut model = SpikingMixer::new(mixer_config)?;

        let mut params = model.init_params(&mut StdRng::seed_from_u64(config.seed))?;
        sync.broadcast(&mut params)?;
        let grad = vec![0.; params.len()];
        info!(model = config.model.as_str(), params = params.len(); "created model");

        let mut optimizer = config.optimizer_spec().build(params.len());
        let mut scheduler = LrScheduler::new(config.lr, config.schedule_spec().build()?);
        let mut scaler = config.amp.then(GradScaler::new);

        let run_dir = RunDir::new(&config);
        let mut start_epoch = config.start_epoch;
        let mut max_test_acc1 = -1.;

        if let Some(resume) = &config.resume {
            let path = match resume.as_str() {
                "latest" => run_dir.latest_checkpoint(),
                other => PathBuf::from(other),
            };
            let checkpoint = Checkpoint::load(&path, model.layout())?;

            params = checkpoint.params;
            model.load_buffers(&checkpoint.buffers)?;
            optimizer.load_state(checkpoint.optimizer)?;
            scheduler.load_state(checkpoint.lr_scheduler);
            if let Some(scaler) = &mut scaler {
                let state = checkpoint.scaler.ok_or_else(|| {
                    TrainErr::Checkpoint(format!("{} holds no scaler state", path.display()))
                })?;
                scaler.load_state(state);
            }

            start_epoch = checkpoint.epoch + 1;
            if sync.is_coordinator() {
                max_test_acc1 = checkpoint.max_test_acc1;
            }
            info!(start_epoch = start_epoch; "resumed from {}", path.display());
        }
        optimizer.set_lr(scheduler.lr());

        let outputs = sync
            .is_coordinator()
            .then(|| open_outputs(&config, run_dir, start_epoch));

        // Every rank fails together when the coordinator cannot open its outputs.
        let mut failed = [outputs.as_ref().map_or(0., |o| o.is_err() as u8 as f32)];
        sync.all_reduce_sum(&mut failed)?;
        let outputs = outputs.transpose()?;
        if failed[0] > 0. {
            return Err(TrainErr::InvalidConfig(
                "the coordinator failed to set up the run directory".into(),
            ));
        }

        Ok(Self {
            config,
            sync,
            model,
            params,
            grad,
            optimizer,
            scheduler,
            scaler,
            loss_fn: Mse::new(),
            encoder: PoissonEncoder::new(),
            train_loader,
            test_loader,
            num_classes,
            start_epoch,
            max_test_acc1,
            outputs,
        })
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub fn max_test_acc1(&self) -> f64 {
        self.max_test_acc1
    }

    /// The learning rate the next epoch trains with.
    pub fn lr(&self) -> f32 {
        self.optimizer.lr()
    }

    /// Trains every remaining epoch, evaluating and checkpointing after each.
    ///
    /// # Returns
    /// The results of the epochs run by this call, in order.
    pub fn run(&mut self) -> Result<Vec<EpochRecord>> {
        let mut records = Vec::with_capacity(self.config.epochs.saturating_sub(self.start_epoch));

        for epoch in self.start_epoch..self.config.epochs {
            let started = Instant::now();
            let lr = self.optimizer.lr();

            self.train_loader.set_epoch(epoch);
            let train = self.train_one_epoch(epoch)?;
            self.log_scalars("train", &train, epoch)?;

            let lr_next = self.scheduler.step();
            self.optimizer.set_lr(lr_next);

            let (test, evaluated) = self.evaluate(epoch)?;
            self.log_scalars("test", &test, epoch)?;

            let improved = test.acc1 > self.max_test_acc1;
            if improved {
                self.max_test_acc1 = test.acc1;
            }
            self.save_checkpoint(epoch, improved)?;

            let remaining = self.config.epochs - epoch;
            let finish = chrono::Local::now()
                + chrono::Duration::from_std(started.elapsed() * remaining as u32)
                    .unwrap_or(chrono::Duration::zero());
            info!(
                epoch = epoch, max_test_acc1 = self.max_test_acc1;
                "escape time={}", finish.format("%Y-%m-%d %H:%M:%S")
            );

            records.push(EpochRecord {
                epoch,
                train,
                test,
                lr,
                evaluated,
            });
        }

        Ok(records)
    }

    /// Runs one pass over this rank's share of the training set.
    fn train_one_epoch(&mut self, epoch: usize) -> Result<EpochResult> {
        let Self {
            config,
            sync,
            model,
            params,
            grad,
            optimizer,
            scaler,
            loss_fn,
            encoder,
            train_loader,
            num_classes,
            ..
        } = self;
        let steps = config.steps;
        let mut solo = Solo;

        model.set_train(true);

        let mut metrics = MetricLogger::new("  ");
        metrics.add_meter("lr", SmoothedValue::new(1, ValueFormat::Value));
        metrics.add_meter("img/s", SmoothedValue::new(10, ValueFormat::Value));

        let header = format!("Epoch: [{epoch}]");
        let total = train_loader.num_batches();
        let mut rng = spike_rng(config.seed, sync.rank(), epoch, 0);

        metrics.start();
        let mut i = 0;
        while let Some(batch) = train_loader.next_batch()? {
            let started = Instant::now();
            let bn_sync: &mut dyn Collective = if config.sync_bn { &mut **sync } else { &mut solo };

            let x = repeat_steps(batch.images.view(), steps)?;
            let x = encoder.encode(x.view(), &mut rng);
            let out = model.forward(params, x.view(), steps, bn_sync)?;
            let y_pred = mean_over_steps(out.view(), steps)?;

            let y = one_hot(&batch.targets, *num_classes);
            let loss = loss_fn.loss(y_pred.view(), y.view());

            let mut d = loss_fn.loss_prime(y_pred.view(), y.view());
            if let Some(scaler) = scaler.as_ref() {
                scaler.scale_grad(d.view_mut());
            }
            let d = spread_over_steps(d.view(), steps)?;

            grad.fill(0.);
            model.backward(params, grad, d, bn_sync)?;
            if let Some(scaler) = scaler.as_ref() {
                scaler.to_half(grad);
            }
            sync.all_reduce_mean(grad)?;

            if let Some(max_norm) = config.clip_grad_norm {
                if let Some(scaler) = scaler.as_mut() {
                    scaler.unscale(grad);
                }
                clip_grad_norm(grad, max_norm);
            }

            match scaler.as_mut() {
                Some(scaler) => {
                    scaler.step(&mut **optimizer, params, grad)?;
                    scaler.update();
                }
                None => optimizer.step(params, grad)?,
            }
            model.reset();

            let batch_size = batch.len() as u64;
            let acc = accuracy(y_pred.view(), &batch.targets, &TOPK);
            metrics.update("loss", loss as f64, 1);
            metrics.update("lr", optimizer.lr() as f64, 1);
            metrics.update("acc1", acc[0] as f64, batch_size);
            metrics.update("acc5", acc[1] as f64, batch_size);
            metrics.update("img/s", throughput(batch_size, started.elapsed()), 1);

            metrics.log_progress(&header, i, total, config.print_freq);
            i += 1;
        }

        metrics.synchronize(&mut **sync)?;
        let result = phase_result(&metrics);
        info!(
            epoch = epoch, loss = result.loss, acc1 = result.acc1, acc5 = result.acc5;
            "{header} train done in {:.1?}", metrics.elapsed()
        );

        Ok(result)
    }

    /// Measures loss and accuracy on this rank's share of the test set.
    ///
    /// # Returns
    /// The phase's metrics and the amount of samples evaluated by every rank.
    fn evaluate(&mut self, epoch: usize) -> Result<(EpochResult, usize)> {
        let Self {
            config,
            sync,
            model,
            params,
            loss_fn,
            encoder,
            test_loader,
            num_classes,
            ..
        } = self;
        let steps = config.steps;
        let mut solo = Solo;

        model.set_train(false);
        test_loader.reset();

        let mut metrics = MetricLogger::new("  ");
        let header = "Test:";
        let total = test_loader.num_batches();
        let mut rng = spike_rng(config.seed, sync.rank(), epoch, 1);
        let mut processed = 0;

        metrics.start();
        let mut i = 0;
        while let Some(batch) = test_loader.next_batch()? {
            let bn_sync: &mut dyn Collective = if config.sync_bn { &mut **sync } else { &mut solo };

            let x = repeat_steps(batch.images.view(), steps)?;
            let x = encoder.encode(x.view(), &mut rng);
            let out = model.forward(params, x.view(), steps, bn_sync)?;
            let y_pred = mean_over_steps(out.view(), steps)?;
            model.reset();

            let y = one_hot(&batch.targets, *num_classes);
            let loss = loss_fn.loss(y_pred.view(), y.view());

            let batch_size = batch.len() as u64;
            let acc = accuracy(y_pred.view(), &batch.targets, &TOPK);
            metrics.update("loss", loss as f64, 1);
            metrics.update("acc1", acc[0] as f64, batch_size);
            metrics.update("acc5", acc[1] as f64, batch_size);
            processed += batch.len();

            metrics.log_progress(header, i, total, config.print_freq);
            i += 1;
        }

        let mut seen = [processed as f64];
        sync.all_reduce_sum_f64(&mut seen)?;
        let evaluated = seen[0] as usize;
        sample_count_mismatch(evaluated, test_loader.dataset().len(), sync.is_coordinator());

        metrics.synchronize(&mut **sync)?;
        let result = phase_result(&metrics);
        info!(
            epoch = epoch, loss = result.loss, acc1 = result.acc1, acc5 = result.acc5;
            "{header} done in {:.1?}", metrics.elapsed()
        );

        Ok((result, evaluated))
    }

    fn log_scalars(&mut self, phase: &str, result: &EpochResult, epoch: usize) -> Result<()> {
        let Some(outputs) = &mut self.outputs else {
            return Ok(());
        };

        for (name, value) in [
            ("loss", result.loss),
            ("acc1", result.acc1),
            ("acc5", result.acc5),
        ] {
            outputs
                .events
                .add_scalar(&format!("{phase}_{name}"), value as f32, epoch)?;
        }

        Ok(())
    }

    fn save_checkpoint(&self, epoch: usize, improved: bool) -> Result<()> {
        let Some(outputs) = &self.outputs else {
            return Ok(());
        };

        let checkpoint = Checkpoint {
            params: self.params.clone(),
            buffers: self.model.buffers(),
            optimizer: self.optimizer.state(),
            lr_scheduler: self.scheduler.state(),
            scaler: self.scaler.as_ref().map(GradScaler::state),
            epoch,
            max_test_acc1: self.max_test_acc1,
            args: self.config.clone(),
        };

        let layout = self.model.layout();
        checkpoint.save(&outputs.run_dir.latest_checkpoint(), layout)?;
        if improved {
            checkpoint.save(&outputs.run_dir.best_checkpoint(), layout)?;
        }

        Ok(())
    }
}

fn open_outputs(config: &RunConfig, run_dir: RunDir, start_epoch: usize) -> Result<Outputs> {
    run_dir.create(config.resume.is_some())?;
    run_dir.write_args(config)?;
    let events = EventWriter::create(&run_dir.tb(), Some(start_epoch))?;
    info!("writing to {}", run_dir.root().display());

    Ok(Outputs { run_dir, events })
}

/// Checks that the ranks evaluated the whole test set exactly once, warning on
/// the coordinator when padding or dropped samples skew the metrics.
///
/// # Returns
/// Whether the counts differ.
fn sample_count_mismatch(evaluated: usize, expected: usize, coordinator: bool) -> bool {
    let mismatch = evaluated != expected;
    if mismatch && coordinator {
        warn!(
            evaluated = evaluated, expected = expected;
            "evaluation visited a different amount of samples than the test set holds"
        );
    }

    mismatch
}

/// The encoder's randomness for one phase of one epoch on one rank.
fn spike_rng(seed: u64, rank: usize, epoch: usize, phase: usize) -> StdRng {
    StdRng::seed_from_u64(sample_seed(seed ^ rank as u64, epoch, usize::MAX - phase))
}

fn throughput(samples: u64, elapsed: Duration) -> f64 {
    samples as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
}

fn phase_result(metrics: &MetricLogger) -> EpochResult {
    EpochResult {
        loss: metrics.global_avg("loss"),
        acc1: metrics.global_avg("acc1"),
        acc5: metrics.global_avg("acc5"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_differing_counts_are_a_mismatch() {
        assert!(!sample_count_mismatch(10_000, 10_000, true));
        // 10 samples over 3 ranks pad up to 12
        assert!(sample_count_mismatch(12, 10, true));
        assert!(sample_count_mismatch(12, 10, false));
    }

    #[test]
    fn throughput_never_divides_by_zero() {
        assert!(throughput(8, Duration::ZERO).is_finite());
        assert_eq!(throughput(8, Duration::from_secs(2)), 4.);
    }
}
