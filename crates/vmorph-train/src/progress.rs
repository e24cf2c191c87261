//! Progress tracking and callbacks for training runs.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Progress information for one optimization step.
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Epoch the step belongs to.
    pub epoch: usize,
    /// Global step number since the run started, starting at 1.
    pub step: usize,
    /// Total number of steps in the run.
    pub total_steps: usize,
    /// Reconstruction term of the batch.
    pub recon: f64,
    /// KL term of the batch.
    pub kl: f64,
    /// Time elapsed since start.
    pub elapsed: Duration,
    /// Estimated remaining time.
    pub estimated_remaining: Option<Duration>,
    pub learning_rate: f64,
}

impl ProgressInfo {
    pub fn loss(&self) -> f64 {
        self.recon + self.kl
    }

    /// Calculate progress percentage.
    pub fn progress_percent(&self) -> f64 {
        if self.total_steps == 0 {
            return 100.0;
        }
        self.step as f64 / self.total_steps as f64 * 100.0
    }

    /// Calculate estimated remaining time.
    pub fn calculate_remaining(&mut self) {
        if self.step > 0 {
            let per_step = self.elapsed.as_secs_f64() / self.step as f64;
            let remaining = self.total_steps.saturating_sub(self.step);
            self.estimated_remaining = Some(Duration::from_secs_f64(per_step * remaining as f64));
        }
    }
}

/// Mean losses of one finished epoch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochSummary {
    /// Epoch number as used in the checkpoint name.
    pub epoch: usize,
    pub recon: f64,
    pub kl: f64,
    pub loss: f64,
}

/// Progress callback trait for monitoring training.
pub trait ProgressCallback: Send + Sync {
    /// Called after every optimization step.
    fn on_step(&self, info: &ProgressInfo);

    fn on_start(&self, _total_steps: usize) {}

    fn on_epoch_end(&self, _summary: &EpochSummary) {}

    fn on_checkpoint(&self, _epoch: usize, _path: &Path) {}

    fn on_complete(&self, _elapsed: Duration) {}

    fn on_error(&self, _error: &str) {}
}

/// Console progress callback that logs to tracing.
#[derive(Debug, Clone)]
pub struct ConsoleProgressCallback {
    /// Log interval (steps).
    pub log_interval: usize,
}

impl Default for ConsoleProgressCallback {
    fn default() -> Self {
        Self { log_interval: 10 }
    }
}

impl ConsoleProgressCallback {
    pub fn new(log_interval: usize) -> Self {
        Self {
            log_interval: log_interval.max(1),
        }
    }
}

impl ProgressCallback for ConsoleProgressCallback {
    fn on_step(&self, info: &ProgressInfo) {
        if info.step % self.log_interval == 0 || info.step == info.total_steps {
            let remaining = info
                .estimated_remaining
                .map(|d| format!("{:.0}s", d.as_secs_f64()))
                .unwrap_or_else(|| "N/A".to_string());

            tracing::info!(
                "Epoch {} | Step {}/{} ({:.1}%) | Loss: {:.6} (recon {:.6}, kl {:.6}) | LR: {:.2e} | ETA: {}",
                info.epoch,
                info.step,
                info.total_steps,
                info.progress_percent(),
                info.loss(),
                info.recon,
                info.kl,
                info.learning_rate,
                remaining
            );
        }
    }

    fn on_start(&self, total_steps: usize) {
        tracing::info!("Training started: {} steps", total_steps);
    }

    fn on_epoch_end(&self, summary: &EpochSummary) {
        tracing::info!(
            "Epoch {} done: loss {:.6} (recon {:.6}, kl {:.6})",
            summary.epoch,
            summary.loss,
            summary.recon,
            summary.kl
        );
    }

    fn on_complete(&self, elapsed: Duration) {
        tracing::info!("Training completed in {:.2}s", elapsed.as_secs_f64());
    }

    fn on_error(&self, error: &str) {
        tracing::error!("Training failed: {}", error);
    }
}

/// History callback that records every step, epoch and checkpoint.
#[derive(Debug, Clone, Default)]
pub struct HistoryCallback {
    steps: Arc<Mutex<Vec<ProgressInfo>>>,
    epochs: Arc<Mutex<Vec<EpochSummary>>>,
    checkpoints: Arc<Mutex<Vec<(usize, PathBuf)>>>,
}

impl HistoryCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn steps(&self) -> Vec<ProgressInfo> {
        self.steps.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn epochs(&self) -> Vec<EpochSummary> {
        self.epochs.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn checkpoints(&self) -> Vec<(usize, PathBuf)> {
        self.checkpoints.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl ProgressCallback for HistoryCallback {
    fn on_step(&self, info: &ProgressInfo) {
        self.steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(info.clone());
    }

    fn on_epoch_end(&self, summary: &EpochSummary) {
        self.epochs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(summary.clone());
    }

    fn on_checkpoint(&self, epoch: usize, path: &Path) {
        self.checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((epoch, path.to_path_buf()));
    }
}

/// Fans training events out to registered callbacks.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    callbacks: Vec<Arc<dyn ProgressCallback>>,
    start_time: Arc<Mutex<Option<Instant>>>,
    learning_rate: f64,
}

impl ProgressTracker {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            ..Self::default()
        }
    }

    pub fn add_callback(&mut self, callback: Arc<dyn ProgressCallback>) {
        self.callbacks.push(callback);
    }

    fn elapsed(&self) -> Duration {
        self.start_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    pub fn start(&self, total_steps: usize) {
        *self.start_time.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        for callback in &self.callbacks {
            callback.on_start(total_steps);
        }
    }

    pub fn step(&self, epoch: usize, step: usize, total_steps: usize, recon: f64, kl: f64) {
        let mut info = ProgressInfo {
            epoch,
            step,
            total_steps,
            recon,
            kl,
            elapsed: self.elapsed(),
            estimated_remaining: None,
            learning_rate: self.learning_rate,
        };
        info.calculate_remaining();

        for callback in &self.callbacks {
            callback.on_step(&info);
        }
    }

    pub fn epoch_end(&self, summary: &EpochSummary) {
        for callback in &self.callbacks {
            callback.on_epoch_end(summary);
        }
    }

    pub fn checkpoint(&self, epoch: usize, path: &Path) {
        for callback in &self.callbacks {
            callback.on_checkpoint(epoch, path);
        }
    }

    pub fn complete(&self) {
        let elapsed = self.elapsed();
        for callback in &self.callbacks {
            callback.on_complete(elapsed);
        }
    }

    pub fn error(&self, error: &str) {
        for callback in &self.callbacks {
            callback.on_error(error);
        }
    }
}
