use burn::tensor::{backend::Backend, Tensor};

/// Everything one forward pass of the registration network produces.
///
/// `displacement` and `log_variance` parameterise the posterior over the
/// velocity field and feed the prior term; `warped` feeds the data term.
/// `deformation` is the integrated, full-resolution field the moving volume
/// was resampled with.
#[derive(Debug, Clone)]
pub struct RegistrationOutput<B: Backend> {
    /// Moving volume resampled into atlas space [B, 1, D, H, W].
    pub warped: Tensor<B, 5>,
    /// Mean velocity field [B, 3, d, h, w].
    pub displacement: Tensor<B, 5>,
    /// Per-voxel log-variance of the velocity field [B, 3, d, h, w].
    pub log_variance: Tensor<B, 5>,
    /// Integrated deformation on the volume grid [B, 3, D, H, W].
    pub deformation: Tensor<B, 5>,
}
