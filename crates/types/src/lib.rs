//! Shared type definitions for the bakery workspace.
//!
//! These types describe the remote resources the engine provisions, the
//! bookkeeping rows it maintains, and the small vocabulary steps use to
//! report progress back to the sequencer. They carry no behaviour beyond
//! parsing and formatting so that the engine, the HTTP provider, and the
//! tracking store can agree on one representation.

pub mod resource;
pub mod run;
pub mod tracking;

pub use resource::{
    CreateImageRequest, ImageDeviceMapping, ResourceHandle, ResourceId, ResourceMetadata, ResourceStatus, UnmappedVirtualization,
    VirtualizationType,
};
pub use run::{AbortReason, StepOutcome, StepState};
pub use tracking::{TrackingKey, TrackingRecord, TrackingUpdate};
