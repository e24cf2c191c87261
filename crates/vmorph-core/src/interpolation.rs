use burn::tensor::{backend::Backend, Int, Tensor};

/// Trilinear interpolation for 3D tensors.
///
/// Samples `image` at continuous voxel coordinates. The sampling grid may
/// live on a different grid than the image (used when resizing flows).
/// Coordinates outside the image take the nearest edge value. A NaN
/// coordinate yields a NaN sample.
///
/// # Arguments
/// * `image` - Input image [B, C, Di, Hi, Wi]
/// * `grid` - Sampling grid [B, 3, Do, Ho, Wo] in voxel coordinates (d, h, w)
///
/// # Returns
/// * Interpolated image [B, C, Do, Ho, Wo]
pub fn trilinear_interpolation<B: Backend>(image: Tensor<B, 5>, grid: Tensor<B, 5>) -> Tensor<B, 5> {
    let [b, c, d_in, h_in, w_in] = image.dims();
    let [_, _, d, h, w] = grid.dims();

    let pd = grid.clone().slice([0..b, 0..1, 0..d, 0..h, 0..w]);
    let ph = grid.clone().slice([0..b, 1..2, 0..d, 0..h, 0..w]);
    let pw = grid.slice([0..b, 2..3, 0..d, 0..h, 0..w]);

    let (d_lo, d_hi, td) = axis_corners(pd, d_in);
    let (h_lo, h_hi, th) = axis_corners(ph, h_in);
    let (w_lo, w_hi, tw) = axis_corners(pw, w_in);

    let volume = image.reshape([b, c, d_in * h_in * w_in]);
    let sample = |index: Tensor<B, 5, Int>| -> Tensor<B, 5> {
        let index = index.reshape([b, 1, d * h * w]).repeat_dim(1, c);
        volume.clone().gather(2, index).reshape([b, c, d, h, w])
    };

    let plane = (h_in * w_in) as i32;
    let row = w_in as i32;
    let rows = [
        d_lo.clone().mul_scalar(plane) + h_lo.clone().mul_scalar(row),
        d_lo.mul_scalar(plane) + h_hi.clone().mul_scalar(row),
        d_hi.clone().mul_scalar(plane) + h_lo.mul_scalar(row),
        d_hi.mul_scalar(plane) + h_hi.mul_scalar(row),
    ];

    // Blend each of the four rows along w, then pairs along h, then d.
    let [r00, r01, r10, r11] = rows.map(|start| {
        lerp(
            sample(start.clone() + w_lo.clone()),
            sample(start + w_hi.clone()),
            tw.clone(),
        )
    });
    let near = lerp(r00, r01, th.clone());
    let far = lerp(r10, r11, th);
    lerp(near, far, td)
}

/// Lower and upper voxel index around `coord` along an axis of `size`
/// voxels, plus the fractional offset from the lower one.
///
/// The offset comes from the unclamped corners, so outside the volume both
/// indices land on the same edge voxel. NaN coordinates index voxel 0 and
/// keep a NaN offset.
fn axis_corners<B: Backend>(coord: Tensor<B, 5>, size: usize) -> (Tensor<B, 5, Int>, Tensor<B, 5, Int>, Tensor<B, 5>) {
    let lo = coord.clone().floor();
    let offset = coord - lo.clone();
    let hi = lo.clone().add_scalar(1.0);
    (to_index(lo, size), to_index(hi, size), offset)
}

fn to_index<B: Backend>(corner: Tensor<B, 5>, size: usize) -> Tensor<B, 5, Int> {
    let nan = corner.clone().is_nan();
    corner.mask_fill(nan, 0.0).clamp(0.0, (size - 1) as f32).int()
}

fn lerp<B: Backend>(a: Tensor<B, 5>, b: Tensor<B, 5>, t: Tensor<B, 5>) -> Tensor<B, 5> {
    a * t.clone().neg().add_scalar(1.0) + b * t
}

/// Identity sampling grid [1, 3, D, H, W] holding the voxel coordinates.
pub fn identity_grid<B: Backend>(dims: [usize; 3], device: &B::Device) -> Tensor<B, 5> {
    let [d, h, w] = dims;

    let d_range = Tensor::<B, 1, Int>::arange(0..d as i64, device)
        .float()
        .reshape([1, 1, d, 1, 1])
        .repeat_dim(3, h)
        .repeat_dim(4, w);
    let h_range = Tensor::<B, 1, Int>::arange(0..h as i64, device)
        .float()
        .reshape([1, 1, 1, h, 1])
        .repeat_dim(2, d)
        .repeat_dim(4, w);
    let w_range = Tensor::<B, 1, Int>::arange(0..w as i64, device)
        .float()
        .reshape([1, 1, 1, 1, w])
        .repeat_dim(2, d)
        .repeat_dim(3, h);

    Tensor::cat(vec![d_range, h_range, w_range], 1)
}
