//! Lifecycle of a training run.

/// Where a [`Trainer`](crate::Trainer) is in its run.
///
/// ```text
/// Uninitialized -> Built -> Checkpointed -> Compiled -> Training <-> Checkpointed
///                                                   \-> Completed
/// ```
///
/// Any state that is not terminal may move to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    /// Inputs validated, no network yet.
    Uninitialized,
    /// Network built and optional weights loaded.
    Built,
    /// Optimizer and loss attached.
    Compiled,
    /// Inside an epoch.
    Training,
    /// A checkpoint was just written.
    Checkpointed,
    Completed,
    Failed,
}

impl TrainerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self -> next` is a legal move.
    pub fn can_transition_to(self, next: TrainerState) -> bool {
        use TrainerState::*;

        if next == Failed {
            return !self.is_terminal();
        }

        matches!(
            (self, next),
            (Uninitialized, Built)
                | (Built, Checkpointed)
                | (Checkpointed, Compiled)
                | (Compiled, Training)
                | (Compiled, Completed)
                | (Training, Checkpointed)
                | (Checkpointed, Training)
                | (Checkpointed, Completed)
        )
    }
}
