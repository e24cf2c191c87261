use burn::{
    module::Module,
    tensor::{backend::Backend, Int, Tensor},
};
use std::marker::PhantomData;

use crate::error::Result;
use crate::grid::validate_flow;
use crate::interpolation::trilinear_interpolation;

/// Warping operator: resamples a volume at `x + flow(x)`.
///
/// Non-integer positions are interpolated trilinearly and positions outside
/// the volume take the nearest edge value.
#[derive(Module, Debug)]
pub struct SpatialTransformer<B: Backend> {
    phantom: PhantomData<B>,
}

impl<B: Backend> Default for SpatialTransformer<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> SpatialTransformer<B> {
    pub fn new() -> Self {
        Self { phantom: PhantomData }
    }

    /// Warp `image` by `flow`, rejecting fields that do not match its grid.
    pub fn warp(&self, image: Tensor<B, 5>, flow: Tensor<B, 5>) -> Result<Tensor<B, 5>> {
        validate_flow(&image, &flow)?;
        Ok(self.forward(image, flow))
    }

    /// Unchecked warp used inside the network graph.
    ///
    /// `image` is [B, C, D, H, W] and `flow` is [B, 3, D, H, W] with
    /// displacements in voxels along (d, h, w).
    pub fn forward(&self, image: Tensor<B, 5>, flow: Tensor<B, 5>) -> Tensor<B, 5> {
        let [b, _, d, h, w] = image.dims();
        let device = image.device();

        let positions: Vec<Tensor<B, 5>> = [d, h, w]
            .into_iter()
            .enumerate()
            .map(|(axis, size)| {
                let mut shape = [1, 1, 1, 1, 1];
                shape[axis + 2] = size;
                let coords = Tensor::<B, 1, Int>::arange(0..size as i64, &device).float().reshape(shape);
                flow.clone().slice([0..b, axis..axis + 1, 0..d, 0..h, 0..w]) + coords
            })
            .collect();

        trilinear_interpolation(image, Tensor::cat(positions, 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::{Distribution, TensorData};
    use burn_ndarray::NdArray;

    type Backend = NdArray<f32>;

    #[test]
    fn test_zero_flow_is_identity() {
        let device = Default::default();
        let stn = SpatialTransformer::<Backend>::new();
        let image = Tensor::<Backend, 5>::random([2, 1, 6, 5, 4], Distribution::Normal(0.0, 1.0), &device);
        let flow = Tensor::<Backend, 5>::zeros([2, 3, 6, 5, 4], &device);

        let warped = stn.warp(image.clone(), flow).unwrap();
        warped.into_data().assert_eq(&image.into_data(), true);
    }

    #[test]
    fn test_unit_shift_along_w() {
        let device = Default::default();
        let stn = SpatialTransformer::<Backend>::new();
        let values: Vec<f32> = (0..4 * 4 * 4).map(|i| (i % 4) as f32).collect();
        let image = Tensor::<Backend, 5>::from_data(TensorData::new(values, [1, 1, 4, 4, 4]), &device);

        let zeros = Tensor::<Backend, 5>::zeros([1, 2, 4, 4, 4], &device);
        let ones = Tensor::<Backend, 5>::ones([1, 1, 4, 4, 4], &device);
        let flow = Tensor::cat(vec![zeros, ones], 1);

        let warped = stn.warp(image, flow).unwrap();
        let data = warped.into_data().to_vec::<f32>().unwrap();
        // Each row becomes [1, 2, 3, 3] (last voxel clamps to the edge).
        assert_eq!(&data[0..4], &[1.0, 2.0, 3.0, 3.0]);
    }

    #[test]
    fn test_warp_rejects_mismatched_flow() {
        let device = Default::default();
        let stn = SpatialTransformer::<Backend>::new();
        let image = Tensor::<Backend, 5>::zeros([1, 1, 4, 4, 4], &device);
        let flow = Tensor::<Backend, 5>::zeros([1, 3, 4, 4, 2], &device);
        assert!(stn.warp(image, flow).is_err());
    }
}
