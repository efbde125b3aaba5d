use std::path::{Path, PathBuf};

use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device, Tensor,
};
use model::{apply_dcgan_init, Critic, Generator};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::{
    checkpoint::{self, CheckpointDescriptor, LoadOutcome, SaveRequest},
    data::{BatchSource, BlockingBatchSource, ImageFolderSource},
    grid::{make_grid, save_grid_png},
    history::History,
    logging::{Logger, LoggingSettings},
    loss::least_squares,
    metrics::TrainingMetrics,
    optimizer::{RmsProp, RmsPropConfig},
    schedule::AlphaSchedule,
    TrainingConfig, TrainingError,
};

const GRID_IMAGES_PER_ROW: usize = 8;
const GRID_PADDING: usize = 2;

/// The four scalar losses recorded for one outer iteration.
#[derive(Debug, Clone, Copy)]
pub struct IterationLosses {
    pub g: f32,
    pub c: f32,
    pub c_real: f32,
    pub c_fake: f32,
}

#[derive(Debug, Clone)]
struct CheckpointSettings {
    directory: PathBuf,
    interval: usize,
    max_keep: Option<usize>,
}

/// Drives the alternating critic/generator optimization, the periodic
/// snapshot and checkpoint schedule, and the resume state machine. Single
/// logical thread of control; every tensor operation is a blocking call.
pub struct Trainer {
    config: TrainingConfig,
    device: Device,
    generator: Generator,
    critic: Critic,
    gen_optim: RmsProp,
    critic_optim: RmsProp,
    source: BlockingBatchSource<Box<dyn BatchSource>>,
    schedule: AlphaSchedule,
    history: History,
    /// Sampled once from a host RNG seeded with the run seed, so restarts
    /// reproduce it and snapshot grids stay comparable across a whole run.
    fixed_noise: Tensor,
    completed_iterations: usize,
    last_checkpoint_iteration: usize,
    metrics: TrainingMetrics,
    logger: Logger,
    checkpoint: Option<CheckpointSettings>,
}

impl Trainer {
    /// Builds a trainer over the configured image folder.
    pub fn new(config: TrainingConfig) -> Result<Self, TrainingError> {
        config.validate()?;
        let device = select_device(config.runtime.seed);
        let root = config.data.root.clone().ok_or_else(|| {
            TrainingError::initialization("data.root must point at an image directory")
        })?;
        let source = ImageFolderSource::new(
            &root,
            device.clone(),
            config.model.image_size,
            config.data.batch_size,
            config.runtime.seed,
        )?;
        println!(
            "[training] batch source ready ({} images, batch_size={})",
            source.len(),
            config.data.batch_size
        );
        Self::assemble(config, device, Box::new(source))
    }

    /// Builds a trainer over an injected batch source. Used by the tests and
    /// by callers that already hold decoded tensors.
    pub fn with_source(
        config: TrainingConfig,
        device: Device,
        source: Box<dyn BatchSource>,
    ) -> Result<Self, TrainingError> {
        config.validate()?;
        if let Err(err) = device.set_seed(config.runtime.seed) {
            eprintln!("warning: failed to seed device RNG: {err}");
        }
        Self::assemble(config, device, source)
    }

    fn assemble(
        config: TrainingConfig,
        device: Device,
        source: Box<dyn BatchSource>,
    ) -> Result<Self, TrainingError> {
        let fixed_noise = fixed_latent_batch(
            config.runtime.snapshot_samples,
            config.model.latent_dim,
            config.runtime.seed,
            &device,
        )?;

        let model_config = config.model_config(device.clone());
        let generator = Generator::new(model_config.clone()).map_err(|err| {
            TrainingError::initialization(format!("failed to build generator: {err}"))
        })?;
        let critic = Critic::new(model_config)
            .map_err(|err| TrainingError::initialization(format!("failed to build critic: {err}")))?;
        apply_dcgan_init(&generator, &critic).map_err(|err| {
            TrainingError::initialization(format!("failed to initialize weights: {err}"))
        })?;

        let optimizer_config = RmsPropConfig::from(&config.optimizer);
        let gen_optim = RmsProp::new(generator.parameters(), optimizer_config)?;
        let critic_optim = RmsProp::new(critic.parameters(), optimizer_config)?;

        let schedule = AlphaSchedule::from_config(&config.schedule)?;

        let logger = Logger::new(LoggingSettings::from_config(
            config.runtime.logging.enable_stdout,
            config.runtime.logging.tensorboard.clone(),
            config.runtime.logging.tensorboard_flush_every_n,
        ))?;

        let checkpoint = config.runtime.checkpoint.as_ref().map(|cfg| CheckpointSettings {
            directory: cfg.directory.clone(),
            interval: cfg.interval,
            max_keep: cfg.max_keep,
        });

        Ok(Self {
            config,
            device,
            generator,
            critic,
            gen_optim,
            critic_optim,
            source: BlockingBatchSource::new(source),
            schedule,
            history: History::new(),
            fixed_noise,
            completed_iterations: 0,
            last_checkpoint_iteration: 0,
            metrics: TrainingMetrics::new(),
            logger,
            checkpoint,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn completed_iterations(&self) -> usize {
        self.completed_iterations
    }

    /// Resumes from the most recent checkpoint under the configured
    /// directory, if any. A present-but-unreadable checkpoint is an error;
    /// an absent one means a fresh start.
    pub fn resume_from_latest(&mut self) -> Result<Option<CheckpointDescriptor>, TrainingError> {
        let Some(settings) = &self.checkpoint else {
            return Ok(None);
        };
        let Some(descriptor) = checkpoint::latest_checkpoint(&settings.directory)? else {
            return Ok(None);
        };
        println!(
            "resuming from checkpoint {} (iteration {})",
            descriptor.directory.display(),
            descriptor.manifest.iteration
        );
        let outcome = checkpoint::load_checkpoint(&descriptor.directory)?;
        self.apply_checkpoint(outcome)?;
        Ok(Some(descriptor))
    }

    pub fn resume_from_path(
        &mut self,
        directory: &Path,
    ) -> Result<CheckpointDescriptor, TrainingError> {
        let outcome = checkpoint::load_checkpoint(directory)?;
        let manifest = outcome.manifest.clone();
        self.apply_checkpoint(outcome)?;
        Ok(CheckpointDescriptor {
            directory: directory.to_path_buf(),
            manifest,
        })
    }

    fn apply_checkpoint(&mut self, outcome: LoadOutcome) -> Result<(), TrainingError> {
        let LoadOutcome {
            manifest,
            history,
            generator_weights,
            critic_weights,
        } = outcome;

        self.generator.load_state(&generator_weights).map_err(|err| {
            TrainingError::resume(format!("failed to load generator weights: {err}"))
        })?;
        self.critic.load_state(&critic_weights).map_err(|err| {
            TrainingError::resume(format!("failed to load critic weights: {err}"))
        })?;

        // Optimizer running statistics are deliberately not persisted; both
        // optimizers restart fresh over the restored parameters.
        let optimizer_config = RmsPropConfig::from(&self.config.optimizer);
        self.gen_optim = RmsProp::new(self.generator.parameters(), optimizer_config)?;
        self.critic_optim = RmsProp::new(self.critic.parameters(), optimizer_config)?;

        self.history = history;
        self.completed_iterations = manifest.iteration;
        self.last_checkpoint_iteration = manifest.iteration;
        Ok(())
    }

    pub fn train(&mut self) -> Result<(), TrainingError> {
        self.train_with_shutdown(|| false)
    }

    /// Runs iterations `completed + 1 ..= max_iterations`, checking
    /// `should_stop` at every iteration boundary. Whatever ends the loop, a
    /// final checkpoint attempt covers the iterations completed since the
    /// last one.
    pub fn train_with_shutdown<F>(&mut self, mut should_stop: F) -> Result<(), TrainingError>
    where
        F: FnMut() -> bool,
    {
        let start = self.completed_iterations + 1;
        let max_iterations = self.config.schedule.max_iterations;

        println!(
            "starting training on {:?} (iterations {}..={}, crit_iters={}, gen_iters={})",
            self.device,
            start,
            max_iterations,
            self.config.schedule.crit_iters,
            self.config.schedule.gen_iters
        );

        for iteration in start..=max_iterations {
            if should_stop() {
                println!("shutdown requested at iteration {iteration}");
                break;
            }

            let alpha = self.schedule.value(iteration);

            let (c_real, c_fake) = self.critic_phase(alpha)?;
            let g = self.generator_phase()?;

            let losses = IterationLosses {
                g,
                c: c_real + c_fake,
                c_real,
                c_fake,
            };
            ensure_finite(iteration, &losses)?;

            // Exactly one entry per outer iteration, whatever the phase
            // multiplicities were.
            self.history.push_losses(losses.g, losses.c_real, losses.c_fake);
            self.completed_iterations = iteration;

            let images = (self.config.data.batch_size
                * (self.config.schedule.crit_iters + self.config.schedule.gen_iters))
                as u64;
            let snapshot = self
                .metrics
                .record_iteration(images, losses.g as f64, losses.c as f64);

            if iteration % self.config.runtime.snapshot_interval == 0 {
                self.take_snapshot(iteration)?;
            }

            if let Some(settings) = self.checkpoint.clone() {
                if iteration % settings.interval == 0 {
                    self.save_checkpoint(&settings, iteration);
                }
            }

            if iteration % self.config.runtime.log_interval == 0 {
                self.logger.log_iteration(iteration, alpha, &losses, &snapshot);
            }
        }

        if let Some(settings) = self.checkpoint.clone() {
            if self.completed_iterations > self.last_checkpoint_iteration {
                self.save_checkpoint(&settings, self.completed_iterations);
            }
        }

        self.logger.flush();
        Ok(())
    }

    /// One critic phase: `crit_iters` updates against real data and detached
    /// generator output. Only the losses of the last sub-iteration are
    /// reported.
    fn critic_phase(&mut self, alpha: f64) -> Result<(f32, f32), TrainingError> {
        self.critic.set_trainable(true);
        let mut last = (0f32, 0f32);

        for _ in 0..self.config.schedule.crit_iters {
            let batch = self.source.next_batch()?;
            let noise = self.sample_noise(self.config.data.batch_size)?;
            // Detached: the critic update must not reach generator weights.
            let fake = self
                .generator
                .forward_t(&noise, true)
                .map_err(to_runtime_error)?
                .detach();

            let real_scores = self
                .critic
                .forward_t(&batch.images, true)
                .map_err(to_runtime_error)?;
            let fake_scores = self
                .critic
                .forward_t(&fake, true)
                .map_err(to_runtime_error)?;

            let real_term = least_squares(&real_scores, 1.0)?;
            // The regression target for fakes ramps with alpha: the critic is
            // asked to score generated data increasingly like real data.
            let fake_term = least_squares(&fake_scores, alpha)?;

            // A fresh backward pass starts from zeroed gradients; the summed
            // loss accumulates both terms into one store.
            let total = real_term
                .loss
                .add(&fake_term.loss)
                .map_err(to_runtime_error)?;
            let mut grads = total.backward().map_err(to_runtime_error)?;
            self.step_critic(&mut grads)?;

            last = (real_term.value, fake_term.value);
        }

        Ok(last)
    }

    /// One generator phase: `gen_iters` updates through a frozen critic.
    /// The critic's forward pass stays in the graph; only its parameters are
    /// excluded from the update.
    fn generator_phase(&mut self) -> Result<f32, TrainingError> {
        self.critic.set_trainable(false);
        let mut last = 0f32;

        for _ in 0..self.config.schedule.gen_iters {
            let noise = self.sample_noise(self.config.data.batch_size)?;
            let fake = self
                .generator
                .forward_t(&noise, true)
                .map_err(to_runtime_error)?;
            let scores = self
                .critic
                .forward_t(&fake, true)
                .map_err(to_runtime_error)?;
            let term = least_squares(&scores, 1.0)?;

            let mut grads = term.loss.backward().map_err(to_runtime_error)?;
            self.step_generator(&mut grads)?;

            last = term.value;
        }

        Ok(last)
    }

    fn step_critic(
        &mut self,
        grads: &mut candle_core::backprop::GradStore,
    ) -> Result<(), TrainingError> {
        if !self.critic.trainable() {
            return Err(TrainingError::runtime(
                "refusing to step the critic while its parameters are frozen",
            ));
        }
        self.critic_optim.step(grads)
    }

    fn step_generator(
        &mut self,
        grads: &mut candle_core::backprop::GradStore,
    ) -> Result<(), TrainingError> {
        if !self.generator.trainable() {
            return Err(TrainingError::runtime(
                "refusing to step the generator while its parameters are frozen",
            ));
        }
        self.gen_optim.step(grads)
    }

    fn sample_noise(&self, count: usize) -> Result<Tensor, TrainingError> {
        Tensor::randn(
            0f32,
            1f32,
            (count, self.config.model.latent_dim, 1, 1),
            &self.device,
        )
        .map_err(to_runtime_error)
    }

    /// Renders the fixed latent batch into a grid and appends it to the
    /// snapshot list. The PNG export is best-effort observability; a failed
    /// write is logged and never interrupts training.
    fn take_snapshot(&mut self, iteration: usize) -> Result<(), TrainingError> {
        let images = self
            .generator
            .forward_t(&self.fixed_noise, false)
            .map_err(to_runtime_error)?
            .detach();
        let grid = make_grid(&images, GRID_IMAGES_PER_ROW, GRID_PADDING)?;

        if let Some(dir) = self.config.runtime.snapshot_dir.clone() {
            if let Err(err) = std::fs::create_dir_all(&dir)
                .map_err(|err| TrainingError::runtime(err.to_string()))
                .and_then(|_| save_grid_png(&grid, &dir.join(format!("iter_{iteration:09}.png"))))
            {
                eprintln!("snapshot PNG export failed at iteration {iteration}: {err}");
            }
        }

        self.history.push_snapshot(grid);
        Ok(())
    }

    /// One checkpoint event with the bounded retry budget. Exhausting the
    /// retries abandons this event and keeps training; the previous
    /// checkpoint stays intact either way.
    fn save_checkpoint(&mut self, settings: &CheckpointSettings, iteration: usize) {
        let request = SaveRequest {
            base_dir: &settings.directory,
            config: &self.config,
            generator: &self.generator,
            critic: &self.critic,
            history: &self.history,
            iteration,
            max_keep: settings.max_keep,
        };
        match checkpoint::save_checkpoint_with_retries(request, checkpoint::SAVE_ATTEMPTS) {
            Ok(descriptor) => {
                self.last_checkpoint_iteration = iteration;
                println!(
                    "[training] checkpoint saved at iteration {} -> {}",
                    iteration,
                    descriptor.directory.display()
                );
            }
            Err(err) => {
                eprintln!(
                    "[training] abandoning checkpoint at iteration {iteration}: {err}"
                );
            }
        }
    }
}

fn ensure_finite(iteration: usize, losses: &IterationLosses) -> Result<(), TrainingError> {
    let finite = losses.g.is_finite()
        && losses.c.is_finite()
        && losses.c_real.is_finite()
        && losses.c_fake.is_finite();
    if finite {
        Ok(())
    } else {
        Err(TrainingError::numerical(format!(
            "non-finite loss at iteration {} (g={}, c_real={}, c_fake={})",
            iteration, losses.g, losses.c_real, losses.c_fake
        )))
    }
}

/// Fixed latent vectors drawn from a host-side seeded RNG. The device RNG
/// cannot be seeded on every backend, so host sampling is what makes the
/// snapshot input reproducible across restarts.
fn fixed_latent_batch(
    samples: usize,
    latent_dim: usize,
    seed: u64,
    device: &Device,
) -> Result<Tensor, TrainingError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let values: Vec<f32> = (0..samples * latent_dim)
        .map(|_| rng.sample(StandardNormal))
        .collect();
    Tensor::from_vec(values, (samples, latent_dim, 1, 1), device)
        .map_err(to_runtime_error)
}

/// Picks the fastest available backend and seeds its RNG where supported.
fn select_device(seed: u64) -> Device {
    let device = if metal_is_available() {
        match Device::new_metal(0) {
            Ok(device) => device,
            Err(err) => {
                eprintln!("failed to initialize metal device, falling back to CPU: {err}");
                Device::Cpu
            }
        }
    } else if cuda_is_available() {
        match Device::new_cuda(0) {
            Ok(device) => device,
            Err(err) => {
                eprintln!("cuda reported available but initialization failed: {err}");
                Device::Cpu
            }
        }
    } else {
        Device::Cpu
    };

    if let Err(err) = device.set_seed(seed) {
        eprintln!("warning: failed to seed device RNG: {err}");
    }
    device
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use candle_core::Var;

    use super::*;
    use crate::config::{
        CheckpointConfig, DataConfig, LoggingConfig, ModelSection, OptimizerConfig, RuntimeConfig,
        ScheduleConfig,
    };
    use crate::data::InMemorySource;

    fn tiny_config() -> TrainingConfig {
        TrainingConfig {
            model: ModelSection {
                latent_dim: 8,
                gen_features: 4,
                critic_features: 4,
                channels: 3,
                image_size: 16,
            },
            data: DataConfig {
                root: None,
                batch_size: 4,
            },
            optimizer: OptimizerConfig {
                learning_rate: 2e-4,
                rho: 0.99,
                epsilon: 1e-8,
            },
            schedule: ScheduleConfig {
                max_iterations: 4,
                warmup_threshold: 2,
                max_alpha: 0.5,
                crit_iters: 1,
                gen_iters: 1,
            },
            runtime: RuntimeConfig {
                seed: 7,
                log_interval: 1,
                snapshot_interval: 2,
                snapshot_samples: 4,
                snapshot_dir: None,
                checkpoint: None,
                logging: LoggingConfig {
                    enable_stdout: false,
                    tensorboard: None,
                    tensorboard_flush_every_n: 1,
                },
            },
        }
    }

    fn tiny_source(seed: u64) -> Box<dyn BatchSource> {
        let images = (0..8)
            .map(|i| {
                Tensor::rand(-1f32, 1f32, (3, 16, 16), &Device::Cpu)
                    .unwrap()
                    .affine(1.0, i as f64 * 1e-3)
                    .unwrap()
            })
            .collect();
        Box::new(InMemorySource::new(images, 4, seed).unwrap())
    }

    fn build_trainer(config: TrainingConfig) -> Trainer {
        Trainer::with_source(config, Device::Cpu, tiny_source(3)).unwrap()
    }

    fn learnable_values(params: &[(String, Var)]) -> Vec<(String, Vec<f32>)> {
        params
            .iter()
            .filter(|(name, _)| !name.contains("running_"))
            .map(|(name, var)| {
                (
                    name.clone(),
                    var.as_tensor()
                        .flatten_all()
                        .unwrap()
                        .to_vec1::<f32>()
                        .unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn critic_phase_never_mutates_generator_parameters() {
        let mut trainer = build_trainer(tiny_config());
        let before = learnable_values(&trainer.generator.parameters());
        trainer.critic_phase(0.0).unwrap();
        let after = learnable_values(&trainer.generator.parameters());
        assert_eq!(before, after);
    }

    #[test]
    fn generator_phase_never_mutates_critic_parameters() {
        let mut trainer = build_trainer(tiny_config());
        let before = learnable_values(&trainer.critic.parameters());
        trainer.generator_phase().unwrap();
        let after = learnable_values(&trainer.critic.parameters());
        assert_eq!(before, after);
    }

    #[test]
    fn phases_do_update_their_own_network() {
        let mut trainer = build_trainer(tiny_config());
        let critic_before = learnable_values(&trainer.critic.parameters());
        trainer.critic_phase(0.0).unwrap();
        let critic_after = learnable_values(&trainer.critic.parameters());
        assert_ne!(critic_before, critic_after);

        let gen_before = learnable_values(&trainer.generator.parameters());
        trainer.generator_phase().unwrap();
        let gen_after = learnable_values(&trainer.generator.parameters());
        assert_ne!(gen_before, gen_after);
    }

    #[test]
    fn stepping_a_frozen_critic_is_rejected() {
        let mut trainer = build_trainer(tiny_config());
        let noise = trainer.sample_noise(2).unwrap();
        let fake = trainer.generator.forward_t(&noise, true).unwrap();
        let scores = trainer.critic.forward_t(&fake, true).unwrap();
        let term = least_squares(&scores, 1.0).unwrap();
        let mut grads = term.loss.backward().unwrap();

        trainer.critic.set_trainable(false);
        let err = trainer.step_critic(&mut grads).unwrap_err();
        assert!(matches!(err, TrainingError::Runtime(_)));
    }

    #[test]
    fn history_grows_by_one_entry_per_iteration() {
        let mut trainer = build_trainer(tiny_config());
        trainer.train().unwrap();
        assert_eq!(trainer.history().len(), 4);
        for k in 0..4 {
            let sum = trainer.history().c_losses_real()[k] + trainer.history().c_losses_fake()[k];
            assert!((trainer.history().c_losses()[k] - sum).abs() < 1e-6);
        }
        // Snapshots at iterations 2 and 4.
        assert_eq!(trainer.history().snapshots().len(), 2);
    }

    #[test]
    fn non_finite_losses_abort_with_a_numerical_error() {
        let losses = IterationLosses {
            g: f32::NAN,
            c: 1.0,
            c_real: 0.5,
            c_fake: 0.5,
        };
        assert!(matches!(
            ensure_finite(17, &losses),
            Err(TrainingError::Numerical(_))
        ));

        let losses = IterationLosses {
            g: 0.1,
            c: f32::INFINITY,
            c_real: f32::INFINITY,
            c_fake: 0.5,
        };
        assert!(matches!(
            ensure_finite(18, &losses),
            Err(TrainingError::Numerical(_))
        ));
    }

    #[test]
    fn fixed_latent_is_reproducible_across_construction() {
        let a = build_trainer(tiny_config());
        let b = build_trainer(tiny_config());
        let va = a.fixed_noise.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let vb = b.fixed_noise.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(va, vb);
    }

    #[test]
    fn shutdown_callback_stops_the_loop_early() {
        let mut config = tiny_config();
        config.schedule.max_iterations = 100;
        config.schedule.warmup_threshold = 50;
        let mut trainer = build_trainer(config);
        let mut remaining = 3;
        trainer
            .train_with_shutdown(move || {
                if remaining == 0 {
                    return true;
                }
                remaining -= 1;
                false
            })
            .unwrap();
        assert_eq!(trainer.completed_iterations(), 3);
        assert_eq!(trainer.history().len(), 3);
    }

    #[test]
    fn final_checkpoint_covers_a_partial_interval() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = tiny_config();
        config.schedule.max_iterations = 3;
        config.runtime.checkpoint = Some(CheckpointConfig {
            directory: tmp.path().to_path_buf(),
            interval: 2,
            max_keep: None,
        });
        let mut trainer = build_trainer(config);
        trainer.train().unwrap();
        // Interval checkpoint at 2, final checkpoint at 3.
        let latest = checkpoint::latest_checkpoint(tmp.path()).unwrap().unwrap();
        assert_eq!(latest.manifest.iteration, 3);
    }
}
