use burn::module::Module;
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use tracing::debug;

use crate::error::{RegistrationError, Result};
use crate::interpolation::{identity_grid, trilinear_interpolation};
use crate::spatial_transform::SpatialTransformer;

/// Scaling-and-squaring integrator for stationary velocity fields.
///
/// The velocity is divided by `2^nsteps`, then composed with itself
/// `nsteps` times (`u <- u + u(x + u)`), approximating the group
/// exponential. With `nsteps = 0` the velocity is used as the displacement.
#[derive(Module, Debug)]
pub struct VecInt<B: Backend> {
    stn: SpatialTransformer<B>,
    nsteps: usize,
}

impl<B: Backend> VecInt<B> {
    pub fn new(nsteps: usize) -> Self {
        Self {
            stn: SpatialTransformer::new(),
            nsteps,
        }
    }

    /// Displacement [B, 3, D, H, W] reached by following `velocity` for unit time.
    pub fn forward(&self, velocity: Tensor<B, 5>) -> Tensor<B, 5> {
        let mut flow = velocity.mul_scalar(0.5_f64.powi(self.nsteps as i32));
        for _ in 0..self.nsteps {
            flow = flow.clone() + self.stn.forward(flow.clone(), flow);
        }
        flow
    }
}

/// Forward-Euler integration of a stationary velocity field.
///
/// Takes `steps` increments of `v(x + phi) / steps`. Much slower than
/// [`VecInt`] for the same accuracy; kept as a reference integrator.
pub fn euler_integrate<B: Backend>(velocity: Tensor<B, 5>, steps: usize) -> Result<Tensor<B, 5>> {
    if steps == 0 {
        return Err(RegistrationError::invalid_configuration(
            "euler integration needs at least one step",
        ));
    }

    let stn = SpatialTransformer::<B>::new();
    let dt = 1.0 / steps as f64;
    let mut phi = velocity.zeros_like();

    for _ in 0..steps {
        let increment = stn.forward(velocity.clone(), phi.clone()).mul_scalar(dt);
        phi = phi + increment;
    }

    Ok(phi)
}

/// Resample a displacement field onto a finer (or coarser) grid.
///
/// Positions are resampled trilinearly and every component is rescaled by
/// the grid ratio along its axis, so that displacements stay expressed in
/// voxels of the target grid.
pub fn resize_flow<B: Backend>(flow: Tensor<B, 5>, target: [usize; 3]) -> Tensor<B, 5> {
    let [b, _, d, h, w] = flow.dims();
    let source = [d, h, w];
    if source == target {
        return flow;
    }

    debug!("Resizing flow from {:?} to {:?}", source, target);
    let device = flow.device();
    let to_source: Vec<f32> = (0..3).map(|k| source[k] as f32 / target[k] as f32).collect();
    let to_target: Vec<f32> = (0..3).map(|k| target[k] as f32 / source[k] as f32).collect();

    let to_source = Tensor::<B, 5>::from_data(TensorData::new(to_source, [1, 3, 1, 1, 1]), &device);
    let to_target = Tensor::<B, 5>::from_data(TensorData::new(to_target, [1, 3, 1, 1, 1]), &device);

    let grid = (identity_grid::<B>(target, &device) * to_source).repeat_dim(0, b);
    trilinear_interpolation(flow, grid) * to_target
}
