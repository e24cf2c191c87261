//! Training run configuration.

use std::path::PathBuf;

use burn::config::Config;
use vmorph_core::RegistrationError;
use vmorph_model::{Miccai2018LossConfig, VxmNetConfig};

/// Name of the training config written next to the checkpoints.
pub const TRAINING_CONFIG_FILE: &str = "training.json";

#[derive(Config, Debug)]
pub struct TrainingConfig {
    /// Directory holding one volume file per training subject.
    pub data_dir: PathBuf,
    /// Fixed atlas every subject is registered to.
    pub atlas_file: PathBuf,
    /// Output directory for checkpoints, created if absent.
    pub model_dir: PathBuf,
    pub model: VxmNetConfig,
    pub loss: Miccai2018LossConfig,
    /// Adam learning rate.
    #[config(default = 1e-4)]
    pub lr: f64,
    /// Epoch index at which training stops.
    #[config(default = 1500)]
    pub epochs: usize,
    /// Optimization steps per epoch; a checkpoint is written after each epoch.
    #[config(default = 100)]
    pub steps_per_epoch: usize,
    #[config(default = 1)]
    pub batch_size: usize,
    /// Weights to start from instead of a fresh initialisation.
    pub load_model_file: Option<PathBuf>,
    /// Epoch index to resume from; names the first checkpoint.
    #[config(default = 0)]
    pub initial_epoch: usize,
    /// Seed for file shuffling and batch sampling.
    #[config(default = 42)]
    pub seed: u64,
    /// Batches prepared ahead of the training loop.
    #[config(default = 4)]
    pub queue_capacity: usize,
    /// Steps between progress log lines.
    #[config(default = 10)]
    pub log_interval: usize,
}

impl TrainingConfig {
    /// Reject settings that cannot produce a run.
    pub fn validate(&self) -> Result<(), RegistrationError> {
        if !(self.lr > 0.0 && self.lr.is_finite()) {
            return Err(RegistrationError::invalid_configuration(format!(
                "learning rate must be positive, got {}",
                self.lr
            )));
        }
        if self.steps_per_epoch == 0 {
            return Err(RegistrationError::invalid_configuration("steps_per_epoch must be positive"));
        }
        if self.batch_size == 0 {
            return Err(RegistrationError::invalid_configuration("batch_size must be positive"));
        }
        if self.queue_capacity == 0 {
            return Err(RegistrationError::invalid_configuration("queue_capacity must be positive"));
        }
        if self.initial_epoch > self.epochs {
            return Err(RegistrationError::invalid_configuration(format!(
                "initial_epoch {} is past the last epoch {}",
                self.initial_epoch, self.epochs
            )));
        }

        self.model.validate()?;
        self.loss.init()?;
        Ok(())
    }

    /// Optimization steps the run will take.
    pub fn total_steps(&self) -> usize {
        (self.epochs - self.initial_epoch.min(self.epochs)) * self.steps_per_epoch
    }
}
