//! Training loop for the vmorph registration network.
//!
//! [`Trainer::prepare`] checks configuration and data without allocating
//! device memory; [`ExecutionContext::train`] then runs the loop on the
//! selected device, writing a checkpoint per epoch.

pub mod config;
pub mod device;
pub mod error;
pub mod progress;
pub mod state;
pub mod trainer;

pub use config::TrainingConfig;
pub use device::ExecutionContext;
pub use error::{Result, TrainingError};
pub use progress::{ConsoleProgressCallback, EpochSummary, HistoryCallback, ProgressCallback, ProgressInfo, ProgressTracker};
pub use state::TrainerState;
pub use trainer::{inference_model, Trainer, TrainingOutcome, TrainingSummary};
