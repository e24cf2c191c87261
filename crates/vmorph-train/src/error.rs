//! Error types for the training loop.

use thiserror::Error;
use vmorph_core::RegistrationError;

use crate::state::TrainerState;

/// Main error type for training runs.
#[derive(Error, Debug)]
pub enum TrainingError {
    /// Typed registration failure (configuration, shapes, numerics, checkpoints).
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// Failure while reading training data.
    #[error(transparent)]
    Data(#[from] anyhow::Error),

    /// The trainer was driven out of order.
    #[error("Invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: TrainerState, to: TrainerState },
}

/// Result type for training runs.
pub type Result<T> = std::result::Result<T, TrainingError>;

impl TrainingError {
    /// The underlying [`RegistrationError`], also when it was raised behind
    /// a data-loading context.
    pub fn registration_error(&self) -> Option<&RegistrationError> {
        match self {
            Self::Registration(err) => Some(err),
            Self::Data(err) => err.downcast_ref::<RegistrationError>(),
            Self::InvalidTransition { .. } => None,
        }
    }

    /// Whether training failed because no usable data was found.
    pub fn is_data_not_found(&self) -> bool {
        matches!(self.registration_error(), Some(RegistrationError::DataNotFound(_)))
    }

    /// Whether training aborted on a non-finite loss.
    pub fn is_numerical_instability(&self) -> bool {
        matches!(self.registration_error(), Some(RegistrationError::NumericalInstability(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_data_not_found_through_context() {
        let inner: anyhow::Result<()> = Err(RegistrationError::data_not_found("empty").into());
        let err: TrainingError = inner.context("discovering volumes").unwrap_err().into();
        assert!(err.is_data_not_found());
        assert!(!err.is_numerical_instability());
    }

    #[test]
    fn test_transition_display() {
        let err = TrainingError::InvalidTransition {
            from: TrainerState::Uninitialized,
            to: TrainerState::Training,
        };
        assert_eq!(err.to_string(), "Invalid state transition: Uninitialized -> Training");
    }
}
