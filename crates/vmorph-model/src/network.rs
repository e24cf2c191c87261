//! Diffeomorphic registration network with uncertainty estimation.

use burn::{
    config::Config,
    module::{Module, Param},
    nn::{
        conv::{Conv3d, Conv3dConfig},
        Initializer, PaddingConfig3d,
    },
    tensor::{backend::Backend, Distribution, Tensor},
};
use tracing::debug;
use vmorph_core::grid::{spatial_dims, validate_divisible, validate_same_grid};
use vmorph_core::{resize_flow, RegistrationError, SpatialTransformer, VecInt};

use crate::output::RegistrationOutput;
use crate::unet::UnetCore;

/// Initial bias of the log-variance head: start almost certain.
const INITIAL_LOG_VARIANCE: f32 = -10.0;

#[derive(Config, Debug)]
pub struct VxmNetConfig {
    /// Encoder channels, one stride-2 stage each.
    #[config(default = "vec![16, 32, 32, 32]")]
    pub enc_features: Vec<usize>,
    /// Decoder channels, see [`UnetCore`] for the layout.
    #[config(default = "vec![32, 32, 32, 32, 16, 3]")]
    pub dec_features: Vec<usize>,
    /// Predict the velocity on the full grid instead of half resolution.
    #[config(default = false)]
    pub full_size: bool,
    /// Scaling-and-squaring steps; zero disables integration.
    #[config(default = 7)]
    pub int_steps: usize,
    #[config(default = 0.2)]
    pub leaky_slope: f64,
}

impl VxmNetConfig {
    /// Check that the decoder schedule fits the encoder schedule.
    pub fn validate(&self) -> vmorph_core::Result<()> {
        let levels = self.enc_features.len();
        if levels == 0 {
            return Err(RegistrationError::invalid_configuration("at least one encoder stage is required"));
        }

        let required = if self.full_size { levels + 2 } else { levels + 1 };
        if self.dec_features.len() < required || self.dec_features.len() > levels + 3 {
            return Err(RegistrationError::invalid_configuration(format!(
                "{} encoder stages need between {} and {} decoder stages (full_size = {}), got {}",
                levels,
                required,
                levels + 3,
                self.full_size,
                self.dec_features.len()
            )));
        }

        if self.enc_features.iter().chain(self.dec_features.iter()).any(|&nf| nf == 0) {
            return Err(RegistrationError::invalid_configuration("feature counts must be positive"));
        }

        Ok(())
    }

    /// Build the network on `device`.
    pub fn init<B: Backend>(&self, device: &B::Device) -> vmorph_core::Result<VxmNet<B>> {
        self.validate()?;

        let unet = UnetCore::new(
            2,
            &self.enc_features,
            &self.dec_features,
            self.full_size,
            self.leaky_slope,
            device,
        );
        let features = unet.out_channels();

        let flow_mean = Conv3dConfig::new([features, 3], [3, 3, 3])
            .with_padding(PaddingConfig3d::Explicit(1, 1, 1))
            .with_initializer(Initializer::Normal { mean: 0.0, std: 1e-5 })
            .init(device);

        let mut flow_log_variance = Conv3dConfig::new([features, 3], [3, 3, 3])
            .with_padding(PaddingConfig3d::Explicit(1, 1, 1))
            .with_initializer(Initializer::Normal { mean: 0.0, std: 1e-10 })
            .init(device);
        flow_log_variance.bias = Some(Param::from_tensor(Tensor::full([3], INITIAL_LOG_VARIANCE, device)));

        debug!(
            "Built registration network: enc {:?}, dec {:?}, full_size {}, int_steps {}",
            self.enc_features, self.dec_features, self.full_size, self.int_steps
        );

        Ok(VxmNet {
            unet,
            flow_mean,
            flow_log_variance,
            integrate: VecInt::new(self.int_steps),
            transformer: SpatialTransformer::new(),
            levels: self.enc_features.len(),
        })
    }
}

/// Registration network mapping `(moving, fixed)` to a diffeomorphic warp.
///
/// The core predicts a Gaussian over a stationary velocity field (mean and
/// log-variance). A velocity is drawn (or the mean taken), integrated with
/// scaling and squaring, brought to the volume grid and used to warp the
/// moving volume.
#[derive(Module, Debug)]
pub struct VxmNet<B: Backend> {
    unet: UnetCore<B>,
    flow_mean: Conv3d<B>,
    flow_log_variance: Conv3d<B>,
    integrate: VecInt<B>,
    transformer: SpatialTransformer<B>,
    levels: usize,
}

impl<B: Backend> VxmNet<B> {
    /// Check that a `(moving, fixed)` pair can go through the network.
    pub fn validate_inputs(&self, moving: &Tensor<B, 5>, fixed: &Tensor<B, 5>) -> vmorph_core::Result<()> {
        validate_same_grid(moving, fixed)?;

        let [b, c, d, h, w] = moving.dims();
        if c != 1 || fixed.dims()[1] != 1 {
            return Err(RegistrationError::shape_mismatch(&[b, 1, d, h, w], &fixed.dims()));
        }

        validate_divisible([d, h, w], self.levels)
    }

    /// Training pass: samples the velocity with the reparameterisation trick.
    pub fn forward(&self, moving: Tensor<B, 5>, fixed: Tensor<B, 5>) -> RegistrationOutput<B> {
        self.run(moving, fixed, true)
    }

    /// Deterministic pass using the mean velocity.
    pub fn register(&self, moving: Tensor<B, 5>, fixed: Tensor<B, 5>) -> RegistrationOutput<B> {
        self.run(moving, fixed, false)
    }

    fn run(&self, moving: Tensor<B, 5>, fixed: Tensor<B, 5>, sample: bool) -> RegistrationOutput<B> {
        let grid = spatial_dims(moving.dims());

        let input = Tensor::cat(vec![moving.clone(), fixed], 1);
        let features = self.unet.forward(input);

        let mean = self.flow_mean.forward(features.clone());
        let log_variance = self.flow_log_variance.forward(features);

        let velocity = if sample {
            let noise = Tensor::random(mean.shape(), Distribution::Normal(0.0, 1.0), &mean.device());
            mean.clone() + log_variance.clone().mul_scalar(0.5).exp() * noise
        } else {
            mean.clone()
        };

        let flow = self.integrate.forward(velocity);
        let deformation = resize_flow(flow, grid);
        let warped = self.transformer.forward(moving, deformation.clone());

        RegistrationOutput {
            warped,
            displacement: mean,
            log_variance,
            deformation,
        }
    }
}
