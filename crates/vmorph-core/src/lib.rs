//! Volumetric building blocks for learning-based deformable registration:
//! grid validation, the warping operator and diffeomorphic velocity
//! integration.

pub mod error;
pub mod grid;
pub mod integration;
pub mod interpolation;
pub mod spatial_transform;

pub use error::{RegistrationError, Result};
pub use integration::{euler_integrate, resize_flow, VecInt};
pub use spatial_transform::SpatialTransformer;
