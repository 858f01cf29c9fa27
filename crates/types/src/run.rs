//! Vocabulary shared between steps and the sequencer.

use serde::{Deserialize, Serialize};

/// What the sequencer should do after a step returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepOutcome {
    /// Proceed to the next step.
    Continue,
    /// Stop the run immediately and roll back.
    Halt,
}

/// Why a run stopped before completing every step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AbortReason {
    /// The run completed or has not aborted.
    #[default]
    None,
    /// An external cancellation was observed.
    Cancelled,
    /// A step returned [`StepOutcome::Halt`].
    Halted,
}

impl AbortReason {
    pub fn is_abort(self) -> bool {
        !matches!(self, AbortReason::None)
    }
}

/// Lifecycle of a single step within one run.
///
/// `NotStarted -> Running -> {Succeeded, Failed}`; a succeeded step moves to
/// `RolledBack` once it has been compensated because the run aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StepState {
    #[default]
    NotStarted,
    Running,
    Succeeded,
    Failed,
    RolledBack,
}
