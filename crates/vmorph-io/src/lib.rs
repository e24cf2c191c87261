//! Volume input for registration training: `.npz` and NIfTI readers,
//! training-file discovery and a background batch producer.

pub mod dataset;
pub mod generator;
pub mod nifti_io;
pub mod npz_io;

/// A single-channel 3D intensity volume `[D, H, W]`.
pub type Volume3 = ndarray::Array3<f32>;

pub use dataset::{discover_volumes, read_volume, shuffle_volumes, volume_grid, volume_to_batch, VolumeFormat};
pub use generator::{BatchProducer, BatchProducerConfig, VolumeBatch};
pub use nifti_io::{read_nifti_volume, write_nifti_volume};
pub use npz_io::{read_npz_volume, write_npz_volume, DEFAULT_VOLUME_KEY};
