//! Training-file discovery and conversion of volumes into batched tensors.

use anyhow::{bail, Context, Result};
use burn::tensor::{backend::Backend, Tensor, TensorData};
use rand::seq::SliceRandom;
use rand::Rng;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use vmorph_core::RegistrationError;

use crate::nifti_io::read_nifti_volume;
use crate::npz_io::{read_npz_volume, DEFAULT_VOLUME_KEY};
use crate::Volume3;

/// On-disk formats accepted for atlas and training volumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeFormat {
    /// NumPy archive with a `vol` array.
    Npz,
    /// NIfTI-1, optionally gzipped.
    Nifti,
}

impl VolumeFormat {
    /// Detect the format from a file name.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".npz") {
            Some(Self::Npz)
        } else if name.ends_with(".nii") || name.ends_with(".nii.gz") {
            Some(Self::Nifti)
        } else {
            None
        }
    }
}

/// Read a volume, dispatching on the file extension.
pub fn read_volume<P: AsRef<Path>>(path: P) -> Result<Volume3> {
    let path = path.as_ref();
    match VolumeFormat::from_path(path) {
        Some(VolumeFormat::Npz) => read_npz_volume(path, DEFAULT_VOLUME_KEY),
        Some(VolumeFormat::Nifti) => read_nifti_volume(path),
        None => bail!("Unsupported volume format: {}", path.display()),
    }
}

/// List every readable volume directly inside `data_dir`, sorted by name.
///
/// A missing directory or one without volumes is a [`RegistrationError::DataNotFound`].
pub fn discover_volumes<P: AsRef<Path>>(data_dir: P) -> Result<Vec<PathBuf>> {
    let data_dir = data_dir.as_ref();
    if !data_dir.is_dir() {
        return Err(RegistrationError::data_not_found(format!(
            "{} is not a directory",
            data_dir.display()
        ))
        .into());
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(data_dir)
        .with_context(|| format!("Failed to list {}", data_dir.display()))?
    {
        let path = entry?.path();
        if path.is_file() && VolumeFormat::from_path(&path).is_some() {
            files.push(path);
        }
    }

    if files.is_empty() {
        return Err(RegistrationError::data_not_found(format!(
            "Could not find any training data in {}",
            data_dir.display()
        ))
        .into());
    }

    files.sort();
    info!("Found {} training volumes in {}", files.len(), data_dir.display());
    Ok(files)
}

/// Shuffle the volume list in place.
pub fn shuffle_volumes<R: Rng + ?Sized>(files: &mut [PathBuf], rng: &mut R) {
    files.shuffle(rng);
    debug!("Shuffled {} volume paths", files.len());
}

/// Spatial grid `[D, H, W]` of a volume.
pub fn volume_grid(volume: &Volume3) -> [usize; 3] {
    let shape = volume.shape();
    [shape[0], shape[1], shape[2]]
}

/// Replicate one volume across the batch: `[batch_size, 1, D, H, W]`.
pub fn volume_to_batch<B: Backend>(
    volume: &Volume3,
    batch_size: usize,
    device: &B::Device,
) -> Tensor<B, 5> {
    let [d, h, w] = volume_grid(volume);
    let data: Vec<f32> = volume.iter().copied().collect();
    let single = Tensor::<B, 5>::from_data(TensorData::new(data, [1, 1, d, h, w]), device);
    single.repeat_dim(0, batch_size)
}
