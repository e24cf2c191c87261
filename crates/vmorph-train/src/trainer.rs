//! Training loop orchestration.
//!
//! A [`Trainer`] is prepared from a [`TrainingConfig`] without touching any
//! device, then [`run`](Trainer::run) on one device. Steps are strictly
//! sequential; the only concurrency is the background batch producer.

use std::fs;
use std::path::{Path, PathBuf};

use burn::config::Config;
use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::cast::ToElement;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info, warn};
use vmorph_core::grid::validate_divisible;
use vmorph_core::RegistrationError;
use vmorph_io::{
    discover_volumes, read_volume, shuffle_volumes, volume_grid, volume_to_batch, BatchProducer, BatchProducerConfig,
    Volume3,
};
use vmorph_model::checkpoint::load_weights;
use vmorph_model::{save_checkpoint, save_model_config, VxmNet};

use crate::config::{TrainingConfig, TRAINING_CONFIG_FILE};
use crate::error::{Result, TrainingError};
use crate::progress::{EpochSummary, ProgressTracker};
use crate::state::TrainerState;

/// Name of the loss history written at the end of a run.
pub const HISTORY_FILE: &str = "history.json";

/// What a finished run leaves behind.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingSummary {
    pub initial_epoch: usize,
    pub epochs: usize,
    pub steps: usize,
    /// Mean losses per epoch, in order.
    pub history: Vec<EpochSummary>,
    /// Every checkpoint written, in order.
    pub checkpoints: Vec<PathBuf>,
}

impl TrainingSummary {
    /// Mean total loss of the last epoch, if any epoch ran.
    pub fn final_loss(&self) -> Option<f64> {
        self.history.last().map(|epoch| epoch.loss)
    }
}

/// A finished run together with the trained network.
pub struct TrainingOutcome<B: AutodiffBackend> {
    pub model: VxmNet<B>,
    pub summary: TrainingSummary,
}

/// Owns the model parameters for the whole run and drives them through
/// [`TrainerState`].
pub struct Trainer {
    config: TrainingConfig,
    state: TrainerState,
    atlas: Volume3,
    files: Vec<PathBuf>,
}

impl Trainer {
    /// Validate the configuration, load the atlas and find training data.
    ///
    /// Everything that can fail before training does so here, before any
    /// device memory is allocated.
    pub fn prepare(config: TrainingConfig) -> Result<Self> {
        config.validate()?;

        let mut files = discover_volumes(&config.data_dir)?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        shuffle_volumes(&mut files, &mut rng);

        let atlas = read_volume(&config.atlas_file)?;
        let grid = volume_grid(&atlas);
        validate_divisible(grid, config.model.enc_features.len())?;
        info!("Atlas {} has grid {:?}", config.atlas_file.display(), grid);

        if let Some(path) = &config.load_model_file {
            if !path.with_extension("mpk").is_file() {
                return Err(RegistrationError::checkpoint(format!(
                    "initial weights {} do not exist",
                    path.display()
                ))
                .into());
            }
        }

        fs::create_dir_all(&config.model_dir).map_err(|e| {
            RegistrationError::checkpoint(format!("cannot create {}: {}", config.model_dir.display(), e))
        })?;
        save_model_config(&config.model, &config.model_dir)?;
        let training_config = config.model_dir.join(TRAINING_CONFIG_FILE);
        config.save(&training_config).map_err(|e| {
            RegistrationError::checkpoint(format!("cannot write {}: {}", training_config.display(), e))
        })?;

        Ok(Self {
            config,
            state: TrainerState::Uninitialized,
            atlas,
            files,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    /// Training files in the order they were shuffled.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    fn transition(&mut self, next: TrainerState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(TrainingError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!("Trainer state {:?} -> {:?}", self.state, next);
        self.state = next;
        Ok(())
    }

    /// Train on `device` until `config.epochs` is reached.
    ///
    /// On failure the trainer ends in [`TrainerState::Failed`] and every
    /// checkpoint written so far stays on disk.
    pub fn run<B: AutodiffBackend>(&mut self, device: &B::Device, tracker: &ProgressTracker) -> Result<TrainingOutcome<B>> {
        match self.train::<B>(device, tracker) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                if self.state.can_transition_to(TrainerState::Failed) {
                    self.state = TrainerState::Failed;
                }
                tracker.error(&describe(&err));
                Err(err)
            }
        }
    }

    fn train<B: AutodiffBackend>(&mut self, device: &B::Device, tracker: &ProgressTracker) -> Result<TrainingOutcome<B>> {
        let model_dir = self.config.model_dir.clone();
        let initial_epoch = self.config.initial_epoch;
        let batch_size = self.config.batch_size;
        let lr = self.config.lr;

        let mut model = self.config.model.init::<B>(device)?;
        if let Some(path) = &self.config.load_model_file {
            model = load_weights(model, path, device)?;
        }
        self.transition(TrainerState::Built)?;

        let mut checkpoints = vec![save_checkpoint(&model, &model_dir, initial_epoch)?];
        tracker.checkpoint(initial_epoch, &checkpoints[0]);
        self.transition(TrainerState::Checkpointed)?;

        let loss = self.config.loss.init()?;
        info!(
            "Loss: image_sigma {}, prior_lambda {}",
            loss.image_sigma(),
            loss.prior_lambda()
        );
        let mut optimizer = AdamConfig::new().init::<B, VxmNet<B>>();
        self.transition(TrainerState::Compiled)?;

        let grid = volume_grid(&self.atlas);
        let atlas = volume_to_batch::<B>(&self.atlas, batch_size, device);
        let producer = BatchProducer::spawn(
            self.files.clone(),
            grid,
            BatchProducerConfig {
                batch_size,
                capacity: self.config.queue_capacity,
                seed: self.config.seed,
            },
        )?;

        let total_steps = self.config.total_steps();
        let mut step = 0;
        let mut history = Vec::new();
        tracker.start(total_steps);

        for epoch in initial_epoch..self.config.epochs {
            self.transition(TrainerState::Training)?;
            let (mut recon_sum, mut kl_sum) = (0.0, 0.0);

            for _ in 0..self.config.steps_per_epoch {
                step += 1;
                let moving = producer.next_batch()?.into_tensor::<B>(device);
                model.validate_inputs(&moving, &atlas)?;

                let output = model.forward(moving, atlas.clone());
                let parts = loss.total(atlas.clone(), &output);
                let recon = parts.recon.clone().into_scalar().to_f64();
                let kl = parts.kl.clone().into_scalar().to_f64();

                if !recon.is_finite() || !kl.is_finite() {
                    warn!("Non-finite loss at epoch {} step {}", epoch, step);
                    return Err(RegistrationError::numerical_instability(format!(
                        "loss is not finite at epoch {}, step {} (recon {}, kl {})",
                        epoch, step, recon, kl
                    ))
                    .into());
                }

                let grads = parts.total.backward();
                let grads = GradientsParams::from_grads(grads, &model);
                model = optimizer.step(lr, model, grads);

                recon_sum += recon;
                kl_sum += kl;
                tracker.step(epoch, step, total_steps, recon, kl);
            }

            let n = self.config.steps_per_epoch as f64;
            let summary = EpochSummary {
                epoch: epoch + 1,
                recon: recon_sum / n,
                kl: kl_sum / n,
                loss: (recon_sum + kl_sum) / n,
            };
            tracker.epoch_end(&summary);
            history.push(summary);

            let path = save_checkpoint(&model, &model_dir, epoch + 1)?;
            tracker.checkpoint(epoch + 1, &path);
            checkpoints.push(path);
            self.transition(TrainerState::Checkpointed)?;
        }

        drop(producer);
        self.transition(TrainerState::Completed)?;
        tracker.complete();

        let summary = TrainingSummary {
            initial_epoch,
            epochs: self.config.epochs,
            steps: step,
            history,
            checkpoints,
        };
        write_history(&model_dir, &summary)?;

        Ok(TrainingOutcome { model, summary })
    }
}

/// Inference copy of a trained network, without autodiff bookkeeping.
pub fn inference_model<B: AutodiffBackend>(model: &VxmNet<B>) -> VxmNet<B::InnerBackend> {
    model.valid()
}

fn write_history(model_dir: &Path, summary: &TrainingSummary) -> Result<()> {
    let path = model_dir.join(HISTORY_FILE);
    let json = serde_json::to_string_pretty(summary)
        .map_err(|e| RegistrationError::checkpoint(format!("cannot encode history: {}", e)))?;
    fs::write(&path, json)
        .map_err(|e| RegistrationError::checkpoint(format!("cannot write {}: {}", path.display(), e)))?;
    Ok(())
}

/// Error message including the cause chain of data errors.
fn describe(err: &TrainingError) -> String {
    match err {
        TrainingError::Data(inner) => format!("{:#}", inner),
        other => other.to_string(),
    }
}
