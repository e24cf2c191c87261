use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use vmorph_model::{Miccai2018LossConfig, VxmNetConfig};
use vmorph_train::{ConsoleProgressCallback, ExecutionContext, ProgressTracker, Trainer, TrainingConfig};

#[derive(Parser)]
#[command(name = "vmorph")]
#[command(about = "Diffeomorphic atlas registration with uncertainty")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the registration network against an atlas
    Train(TrainArgs),
}

#[derive(Args)]
struct TrainArgs {
    /// Folder with one volume file per subject
    data_dir: PathBuf,

    /// Atlas volume (.npz with a `vol` array, or NIfTI)
    #[arg(long = "atlas_file", default_value = "../data/atlas_norm.npz")]
    atlas_file: PathBuf,

    /// Models folder
    #[arg(long = "model_dir", default_value = "../models/")]
    model_dir: PathBuf,

    /// GPU index; trains on the CPU when absent
    #[arg(long = "gpu", env = "VMORPH_GPU")]
    gpu: Option<usize>,

    /// Learning rate
    #[arg(long = "lr", default_value_t = 1e-4)]
    lr: f64,

    /// Number of epochs
    #[arg(long = "epochs", default_value_t = 1500)]
    epochs: usize,

    /// Strength of the smoothness prior
    #[arg(long = "prior_lambda", default_value_t = 10.0)]
    prior_lambda: f64,

    /// Image noise parameter
    #[arg(long = "image_sigma", default_value_t = 0.02)]
    image_sigma: f64,

    /// Steps between checkpoints
    #[arg(long = "steps_per_epoch", default_value_t = 100)]
    steps_per_epoch: usize,

    #[arg(long = "batch_size", default_value_t = 1)]
    batch_size: usize,

    /// Checkpoint to initialise the weights from
    #[arg(long = "load_model_file")]
    load_model_file: Option<PathBuf>,

    /// Epoch to resume from
    #[arg(long = "initial_epoch", default_value_t = 0)]
    initial_epoch: usize,

    /// Seed for shuffling and batch sampling
    #[arg(long = "seed", default_value_t = 42)]
    seed: u64,
}

impl TrainArgs {
    fn into_config(self) -> TrainingConfig {
        let loss = Miccai2018LossConfig::new()
            .with_prior_lambda(self.prior_lambda)
            .with_image_sigma(self.image_sigma);

        TrainingConfig::new(self.data_dir, self.atlas_file, self.model_dir, VxmNetConfig::new(), loss)
            .with_lr(self.lr)
            .with_epochs(self.epochs)
            .with_steps_per_epoch(self.steps_per_epoch)
            .with_batch_size(self.batch_size)
            .with_load_model_file(self.load_model_file)
            .with_initial_epoch(self.initial_epoch)
            .with_seed(self.seed)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train(args) => train(args)?,
    }

    Ok(())
}

fn train(args: TrainArgs) -> Result<()> {
    let context = ExecutionContext::from_gpu_index(args.gpu);
    let config = args.into_config();
    info!("Training data: {}", config.data_dir.display());

    let mut trainer = Trainer::prepare(config).context("Training setup failed")?;

    let mut tracker = ProgressTracker::new(trainer.config().lr);
    tracker.add_callback(Arc::new(ConsoleProgressCallback::new(trainer.config().log_interval)));

    let summary = context.train(&mut trainer, &tracker).context("Training failed")?;
    info!(
        "Wrote {} checkpoints to {}",
        summary.checkpoints.len(),
        trainer.config().model_dir.display()
    );
    if let Some(loss) = summary.final_loss() {
        info!("Final epoch loss: {:.6}", loss);
    }
    Ok(())
}
