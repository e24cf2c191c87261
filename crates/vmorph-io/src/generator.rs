//! Background production of training batches.
//!
//! A single worker thread samples training files, loads them and hands
//! host-side batches to the training loop through a bounded queue. The
//! worker never touches model parameters or device memory.

use anyhow::{anyhow, Context, Result};
use burn::tensor::{backend::Backend, Tensor, TensorData};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread::JoinHandle;
use tracing::{debug, warn};
use vmorph_core::RegistrationError;

use crate::dataset::{read_volume, volume_grid};

/// Settings for the batch producer.
#[derive(Debug, Clone)]
pub struct BatchProducerConfig {
    /// Volumes per batch.
    pub batch_size: usize,
    /// Batches buffered ahead of the consumer.
    pub capacity: usize,
    /// Seed for file sampling.
    pub seed: u64,
}

impl Default for BatchProducerConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            capacity: 4,
            seed: 0,
        }
    }
}

/// A batch of moving volumes held in host memory.
#[derive(Debug, Clone)]
pub struct VolumeBatch {
    /// Row-major voxels of shape `[batch, 1, D, H, W]`.
    pub data: Vec<f32>,
    /// Tensor shape of the batch.
    pub shape: [usize; 5],
    /// Files the batch was drawn from, in batch order.
    pub sources: Vec<PathBuf>,
}

impl VolumeBatch {
    /// Move the batch onto `device`.
    pub fn into_tensor<B: Backend>(self, device: &B::Device) -> Tensor<B, 5> {
        Tensor::from_data(TensorData::new(self.data, self.shape), device)
    }
}

/// Load `batch_size` volumes sampled with replacement from `files`.
pub fn sample_batch<R: Rng + ?Sized>(
    files: &[PathBuf],
    grid: [usize; 3],
    batch_size: usize,
    rng: &mut R,
) -> Result<VolumeBatch> {
    let [d, h, w] = grid;
    let mut data = Vec::with_capacity(batch_size * d * h * w);
    let mut sources = Vec::with_capacity(batch_size);

    for _ in 0..batch_size {
        let path = &files[rng.gen_range(0..files.len())];
        let volume = read_volume(path)?;
        let found = volume_grid(&volume);
        if found != grid {
            return Err(anyhow::Error::new(RegistrationError::shape_mismatch(&grid, &found))
                .context(format!("{} does not match the atlas grid", path.display())));
        }
        data.extend(volume.iter().copied());
        sources.push(path.clone());
    }

    Ok(VolumeBatch {
        data,
        shape: [batch_size, 1, d, h, w],
        sources,
    })
}

/// Bounded-queue producer of [`VolumeBatch`]es running on its own thread.
///
/// The first failed batch is delivered to the consumer and ends production.
/// Dropping the producer disconnects the queue and joins the worker.
pub struct BatchProducer {
    receiver: Option<Receiver<Result<VolumeBatch>>>,
    handle: Option<JoinHandle<()>>,
}

impl BatchProducer {
    /// Start producing batches of volumes on `grid` from `files`.
    pub fn spawn(files: Vec<PathBuf>, grid: [usize; 3], config: BatchProducerConfig) -> Result<Self> {
        if files.is_empty() {
            return Err(RegistrationError::data_not_found("batch producer has no files").into());
        }
        if config.batch_size == 0 || config.capacity == 0 {
            return Err(RegistrationError::invalid_configuration(
                "batch size and queue capacity must be positive",
            )
            .into());
        }

        let (sender, receiver) = sync_channel(config.capacity);
        let handle = std::thread::Builder::new()
            .name("vmorph-batches".to_string())
            .spawn(move || produce(files, grid, config, sender))
            .context("Failed to spawn batch producer thread")?;

        Ok(Self {
            receiver: Some(receiver),
            handle: Some(handle),
        })
    }

    /// Block until the next batch is available.
    pub fn next_batch(&self) -> Result<VolumeBatch> {
        let receiver = self
            .receiver
            .as_ref()
            .ok_or_else(|| anyhow!("batch producer already shut down"))?;
        receiver
            .recv()
            .map_err(|_| anyhow!("batch producer stopped unexpectedly"))?
    }
}

impl Iterator for BatchProducer {
    type Item = Result<VolumeBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.as_ref()?.recv().ok()
    }
}

impl Drop for BatchProducer {
    fn drop(&mut self) {
        // Disconnect first so a worker blocked on a full queue wakes up.
        self.receiver.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("batch producer thread panicked");
            }
        }
    }
}

fn produce(
    files: Vec<PathBuf>,
    grid: [usize; 3],
    config: BatchProducerConfig,
    sender: SyncSender<Result<VolumeBatch>>,
) {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut produced = 0usize;

    loop {
        let batch = sample_batch(&files, grid, config.batch_size, &mut rng);
        let failed = batch.is_err();
        if let Err(e) = &batch {
            warn!("Failed to load training batch: {:#}", e);
        }
        if sender.send(batch).is_err() {
            debug!("Batch consumer disconnected after {} batches", produced);
            return;
        }
        if failed {
            return;
        }
        produced += 1;
    }
}
