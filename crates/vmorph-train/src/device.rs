//! Explicit device selection for a training run.

use burn::backend::ndarray::NdArrayDevice;
use burn::backend::{Autodiff, NdArray};
use tracing::info;
#[cfg(not(feature = "wgpu"))]
use vmorph_core::RegistrationError;

use crate::error::Result;
use crate::progress::ProgressTracker;
use crate::trainer::{Trainer, TrainingSummary};

/// Backend used for CPU training.
pub type CpuBackend = Autodiff<NdArray<f32>>;

#[cfg(feature = "wgpu")]
pub type GpuBackend = Autodiff<burn::backend::Wgpu>;

/// Where every tensor of a run lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionContext {
    #[default]
    Cpu,
    /// Discrete GPU by index.
    Gpu(usize),
}

impl ExecutionContext {
    /// GPU `index` when one is given, CPU otherwise.
    pub fn from_gpu_index(index: Option<usize>) -> Self {
        index.map_or(Self::Cpu, Self::Gpu)
    }

    /// Run `trainer` on this context and return its summary.
    pub fn train(self, trainer: &mut Trainer, tracker: &ProgressTracker) -> Result<TrainingSummary> {
        info!("Training on {:?}", self);
        match self {
            Self::Cpu => {
                let device = NdArrayDevice::Cpu;
                Ok(trainer.run::<CpuBackend>(&device, tracker)?.summary)
            }
            #[cfg(feature = "wgpu")]
            Self::Gpu(index) => {
                let device = burn::backend::wgpu::WgpuDevice::DiscreteGpu(index);
                Ok(trainer.run::<GpuBackend>(&device, tracker)?.summary)
            }
            #[cfg(not(feature = "wgpu"))]
            Self::Gpu(index) => Err(RegistrationError::invalid_configuration(format!(
                "GPU {} requested but vmorph was built without the `wgpu` feature",
                index
            ))
            .into()),
        }
    }
}
