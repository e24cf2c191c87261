//! Probabilistic diffeomorphic registration network.
//!
//! [`VxmNet`] predicts a Gaussian over a stationary velocity field,
//! integrates a sample of it into a diffeomorphic deformation and warps the
//! moving volume. [`Miccai2018Loss`] is the matching variational objective.

pub mod checkpoint;
pub mod losses;
pub mod network;
pub mod output;
pub mod unet;

pub use checkpoint::{
    checkpoint_path, list_checkpoints, load_checkpoint, load_model_config, save_checkpoint, save_model_config,
};
pub use losses::{LossComponents, Miccai2018Loss, Miccai2018LossConfig, ReconWeighting};
pub use network::{VxmNet, VxmNetConfig};
pub use output::RegistrationOutput;
