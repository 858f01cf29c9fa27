//! Error types raised by the provisioning engine.

use bakery_types::{ResourceId, UnmappedVirtualization};
use thiserror::Error;

use crate::{poll::WaitError, provider::ProviderError, tracking::TrackingError};

/// Contract violations when reading the execution context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("required state key '{0}' is missing")]
    MissingKey(&'static str),

    #[error("state key '{0}' holds a value of another type")]
    TypeMismatch(&'static str),
}

/// Fatal failures that halt a step.
///
/// Every variant is recorded under the context's `error` key and echoed to
/// the UI before the step returns [`StepOutcome::Halt`](bakery_types::StepOutcome::Halt).
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("Error creating image: {0}")]
    Create(#[source] ProviderError),

    #[error("Error waiting for image: {0}")]
    Wait(#[source] WaitError),

    #[error("Error classifying source image: {0}")]
    Classification(#[from] UnmappedVirtualization),

    #[error("Error updating tracking store: {0}")]
    Tracking(#[source] TrackingError),

    #[error("Error searching for image: {0}")]
    Describe(#[source] ProviderError),

    #[error("Error searching for image: '{0}' was not returned by the provider")]
    ImageNotListed(ResourceId),

    #[error("Error inspecting source image: {0}")]
    SourceLookup(#[source] ProviderError),

    #[error("Error inspecting source image: '{0}' does not exist")]
    SourceImageNotFound(ResourceId),
}

impl StepError {
    /// True for wiring defects and source images the engine cannot classify,
    /// as opposed to failures reported by a remote service.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, StepError::State(_) | StepError::Classification(_))
    }
}
