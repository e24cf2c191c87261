use anyhow::{Context, Result};
use ndarray::Ix3;
use nifti::{IntoNdArray, NiftiObject, ReaderOptions};
use std::path::Path;

use crate::Volume3;

/// Read a 3D NIfTI-1 volume (`.nii` or `.nii.gz`).
///
/// Only voxel intensities are kept; the registration network works in voxel
/// space, so the header's world transform is ignored. Axes keep the file
/// order `[X, Y, Z]`.
pub fn read_nifti_volume<P: AsRef<Path>>(path: P) -> Result<Volume3> {
    let path = path.as_ref();
    let obj = ReaderOptions::new()
        .read_file(path)
        .with_context(|| format!("Failed to read NIfTI file {}", path.display()))?;

    let volume = obj
        .into_volume()
        .into_ndarray::<f32>()
        .context("Failed to convert volume to ndarray")?;

    let ndim = volume.ndim();
    let volume = volume
        .into_dimensionality::<Ix3>()
        .map_err(|_| anyhow::anyhow!("Expected 3D NIfTI file, found {} dimensions", ndim))?;

    Ok(volume.as_standard_layout().into_owned())
}

/// Write a 3D volume to a NIfTI-1 file.
pub fn write_nifti_volume<P: AsRef<Path>>(path: P, volume: &Volume3) -> Result<()> {
    let path = path.as_ref();
    nifti::writer::WriterOptions::new(path)
        .write_nifti(volume)
        .map_err(|e| anyhow::anyhow!("Failed to write NIfTI file {}: {}", path.display(), e))?;
    Ok(())
}
