//! Grid validation for volumes and displacement fields.
//!
//! Volumes are `[B, C, D, H, W]` tensors. Every volume, displacement field
//! and log-variance field that takes part in one registration must live on
//! the same `D x H x W` grid.

use burn::tensor::{backend::Backend, Tensor};

use crate::error::{RegistrationError, Result};

/// Number of spatial axes of a volumetric grid.
pub const NDIMS: usize = 3;

/// Spatial part `[D, H, W]` of a `[B, C, D, H, W]` shape.
pub fn spatial_dims(dims: [usize; 5]) -> [usize; 3] {
    [dims[2], dims[3], dims[4]]
}

/// Validate that two volumes share batch size and spatial grid.
///
/// Channel counts are allowed to differ.
pub fn validate_same_grid<B: Backend>(a: &Tensor<B, 5>, b: &Tensor<B, 5>) -> Result<()> {
    let a_dims = a.dims();
    let b_dims = b.dims();

    if a_dims[0] != b_dims[0] || spatial_dims(a_dims) != spatial_dims(b_dims) {
        return Err(RegistrationError::shape_mismatch(&a_dims, &b_dims));
    }

    Ok(())
}

/// Validate that `flow` is a displacement field for `volume`.
pub fn validate_flow<B: Backend>(volume: &Tensor<B, 5>, flow: &Tensor<B, 5>) -> Result<()> {
    validate_same_grid(volume, flow)?;

    let [b, c, d, h, w] = flow.dims();
    if c != NDIMS {
        return Err(RegistrationError::shape_mismatch(&[b, NDIMS, d, h, w], &[b, c, d, h, w]));
    }

    Ok(())
}

/// Validate that every spatial axis can be halved `levels` times.
pub fn validate_divisible(grid: [usize; 3], levels: usize) -> Result<()> {
    let factor = 1usize << levels;
    if grid.iter().any(|&n| n == 0 || n % factor != 0) {
        return Err(RegistrationError::invalid_configuration(format!(
            "grid {:?} must be divisible by {} for {} downsampling levels",
            grid, factor, levels
        )));
    }
    Ok(())
}
