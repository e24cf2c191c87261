//! Variational registration loss with uncertainty.
//!
//! The objective is the negative evidence lower bound of a probabilistic
//! registration model: a Gaussian image likelihood on the warped volume
//! (the reconstruction term) plus the KL divergence between the predicted
//! Gaussian over the velocity field and a smoothness prior whose precision is
//! `prior_lambda` times the Laplacian of the voxel grid graph.

use burn::{
    config::Config,
    tensor::{backend::Backend, Tensor, TensorData},
};
use serde::{Deserialize, Serialize};
use vmorph_core::grid::NDIMS;
use vmorph_core::RegistrationError;

use crate::output::RegistrationOutput;

/// How the reconstruction term weights squared intensity errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconWeighting {
    /// Every voxel is divided by its predicted variance and pays `ln(variance)`.
    Heteroscedastic,
    /// Plain mean squared error, ignoring predicted variance.
    Homoscedastic,
}

#[derive(Config, Debug)]
pub struct Miccai2018LossConfig {
    /// Image noise standard deviation.
    #[config(default = 0.02)]
    pub image_sigma: f64,
    /// Strength of the smoothness prior.
    #[config(default = 10.0)]
    pub prior_lambda: f64,
    /// Added to every predicted variance so it never reaches zero.
    #[config(default = 1e-6)]
    pub variance_floor: f64,
    /// Log-variances are clamped to this value before exponentiation.
    #[config(default = 20.0)]
    pub max_log_variance: f64,
    #[config(default = "ReconWeighting::Heteroscedastic")]
    pub weighting: ReconWeighting,
}

impl Miccai2018LossConfig {
    pub fn init(&self) -> vmorph_core::Result<Miccai2018Loss> {
        if !(self.image_sigma > 0.0 && self.image_sigma.is_finite()) {
            return Err(RegistrationError::invalid_configuration(format!(
                "image_sigma must be positive, got {}",
                self.image_sigma
            )));
        }
        if !(self.prior_lambda >= 0.0 && self.prior_lambda.is_finite()) {
            return Err(RegistrationError::invalid_configuration(format!(
                "prior_lambda must be non-negative, got {}",
                self.prior_lambda
            )));
        }
        if self.variance_floor.is_nan() || self.variance_floor <= 0.0 {
            return Err(RegistrationError::invalid_configuration(format!(
                "variance_floor must be positive, got {}",
                self.variance_floor
            )));
        }

        Ok(Miccai2018Loss {
            image_sigma: self.image_sigma,
            prior_lambda: self.prior_lambda,
            variance_floor: self.variance_floor,
            max_log_variance: self.max_log_variance,
            weighting: self.weighting,
        })
    }
}

/// Loss terms of one batch.
#[derive(Debug, Clone)]
pub struct LossComponents<B: Backend> {
    /// Data term.
    pub recon: Tensor<B, 1>,
    /// Prior term.
    pub kl: Tensor<B, 1>,
    /// `recon + kl`.
    pub total: Tensor<B, 1>,
}

/// Reconstruction and KL terms of the diffeomorphic registration model.
#[derive(Debug, Clone)]
pub struct Miccai2018Loss {
    image_sigma: f64,
    prior_lambda: f64,
    variance_floor: f64,
    max_log_variance: f64,
    weighting: ReconWeighting,
}

impl Miccai2018Loss {
    pub fn image_sigma(&self) -> f64 {
        self.image_sigma
    }

    pub fn prior_lambda(&self) -> f64 {
        self.prior_lambda
    }

    /// Data term between the atlas and the warped moving volume.
    pub fn recon_loss<B: Backend>(&self, atlas: Tensor<B, 5>, output: &RegistrationOutput<B>) -> Tensor<B, 1> {
        self.reconstruction(atlas, output.warped.clone(), output.log_variance.clone())
    }

    /// Prior term on the predicted velocity distribution.
    pub fn kl_loss<B: Backend>(&self, output: &RegistrationOutput<B>) -> Tensor<B, 1> {
        self.kl_divergence(output.displacement.clone(), output.log_variance.clone())
    }

    /// Both terms and their sum.
    pub fn total<B: Backend>(&self, atlas: Tensor<B, 5>, output: &RegistrationOutput<B>) -> LossComponents<B> {
        let recon = self.recon_loss(atlas, output);
        let kl = self.kl_loss(output);
        let total = recon.clone() + kl.clone();
        LossComponents { recon, kl, total }
    }

    /// `mean(err^2 / v + ln v) / sigma^2`, or `mean(err^2) / sigma^2` when
    /// homoscedastic.
    ///
    /// `log_variance` may have any channel count and any grid that divides the
    /// atlas grid evenly; it is averaged over channels and upsampled by
    /// nearest neighbour to the atlas grid.
    pub fn reconstruction<B: Backend>(
        &self,
        atlas: Tensor<B, 5>,
        warped: Tensor<B, 5>,
        log_variance: Tensor<B, 5>,
    ) -> Tensor<B, 1> {
        let scale = 1.0 / (self.image_sigma * self.image_sigma);
        let squared_error = (atlas - warped).powf_scalar(2.0);

        match self.weighting {
            ReconWeighting::Homoscedastic => squared_error.mean().mul_scalar(scale),
            ReconWeighting::Heteroscedastic => {
                let [_, _, d, h, w] = squared_error.dims();
                let log_variance = upsample_to(log_variance.mean_dim(1), [d, h, w]);
                let variance = log_variance
                    .clamp_max(self.max_log_variance)
                    .exp()
                    .add_scalar(self.variance_floor);

                let nll = squared_error / variance.clone() + variance.log();
                nll.mean().mul_scalar(scale)
            }
        }
    }

    /// `ndims / 2 * (mean(lambda * deg * exp(s) - s) + lambda * energy(mu))`.
    ///
    /// `deg` counts each voxel's grid neighbours, `energy` is the graph
    /// Laplacian quadratic form of the mean field (see [`laplacian_energy`]).
    /// Means over voxels keep the term independent of the grid resolution.
    pub fn kl_divergence<B: Backend>(&self, mean: Tensor<B, 5>, log_variance: Tensor<B, 5>) -> Tensor<B, 1> {
        let [_, _, d, h, w] = mean.dims();
        let degree = degree_matrix::<B>([d, h, w], &mean.device());

        let log_variance = log_variance.clamp_max(self.max_log_variance);
        let sigma_term = (degree * log_variance.clone().exp()).mul_scalar(self.prior_lambda) - log_variance;
        let sigma_term = sigma_term.mean();

        let precision_term = laplacian_energy(mean).mul_scalar(self.prior_lambda);

        (sigma_term + precision_term).mul_scalar(0.5 * NDIMS as f64)
    }
}

/// Number of in-grid neighbours of every voxel, [1, 1, D, H, W].
///
/// This is the degree diagonal of the 6-connected grid graph Laplacian.
pub fn degree_matrix<B: Backend>(grid: [usize; 3], device: &B::Device) -> Tensor<B, 5> {
    let [d, h, w] = grid;
    let along = |n: usize| -> Vec<f32> {
        (0..n)
            .map(|i| (i > 0) as u8 as f32 + (i + 1 < n) as u8 as f32)
            .collect()
    };

    let deg_d = Tensor::<B, 5>::from_data(TensorData::new(along(d), [1, 1, d, 1, 1]), device)
        .repeat_dim(3, h)
        .repeat_dim(4, w);
    let deg_h = Tensor::<B, 5>::from_data(TensorData::new(along(h), [1, 1, 1, h, 1]), device)
        .repeat_dim(2, d)
        .repeat_dim(4, w);
    let deg_w = Tensor::<B, 5>::from_data(TensorData::new(along(w), [1, 1, 1, 1, w]), device)
        .repeat_dim(2, d)
        .repeat_dim(3, h);

    deg_d + deg_h + deg_w
}

/// `0.5 / ndims * sum_axis mean((mu[i+1] - mu[i])^2)`.
///
/// Zero for spatially constant fields. Axes of length one contribute nothing.
pub fn laplacian_energy<B: Backend>(field: Tensor<B, 5>) -> Tensor<B, 1> {
    let [b, c, d, h, w] = field.dims();
    let device = field.device();
    let mut energy = Tensor::<B, 1>::zeros([1], &device);

    if d > 1 {
        let diff = field.clone().slice([0..b, 0..c, 1..d, 0..h, 0..w])
            - field.clone().slice([0..b, 0..c, 0..d - 1, 0..h, 0..w]);
        energy = energy + diff.powf_scalar(2.0).mean();
    }
    if h > 1 {
        let diff = field.clone().slice([0..b, 0..c, 0..d, 1..h, 0..w])
            - field.clone().slice([0..b, 0..c, 0..d, 0..h - 1, 0..w]);
        energy = energy + diff.powf_scalar(2.0).mean();
    }
    if w > 1 {
        let diff = field.clone().slice([0..b, 0..c, 0..d, 0..h, 1..w])
            - field.slice([0..b, 0..c, 0..d, 0..h, 0..w - 1]);
        energy = energy + diff.powf_scalar(2.0).mean();
    }

    energy.mul_scalar(0.5 / NDIMS as f64)
}

/// Nearest-neighbour upsampling of a [B, C, d, h, w] field by integer factors.
fn upsample_to<B: Backend>(field: Tensor<B, 5>, target: [usize; 3]) -> Tensor<B, 5> {
    let [b, c, d, h, w] = field.dims();
    if [d, h, w] == target {
        return field;
    }
    let [fd, fh, fw] = [target[0] / d, target[1] / h, target[2] / w];

    let field = field.reshape([b, c, d, 1, h * w]).repeat_dim(3, fd).reshape([b, c, d * fd, h, w]);
    let field = field
        .reshape([b, c * d * fd, h, 1, w])
        .repeat_dim(3, fh)
        .reshape([b, c, d * fd, h * fh, w]);
    field
        .reshape([b, c * d * fd * h * fh, w, 1])
        .repeat_dim(3, fw)
        .reshape([b, c, d * fd, h * fh, w * fw])
}
