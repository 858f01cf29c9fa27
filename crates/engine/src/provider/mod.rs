//! Remote provider abstraction.
//!
//! The engine depends only on four operation shapes: create, describe,
//! deregister and list. Concrete providers translate them to a wire format;
//! [`InMemoryProvider`] keeps everything in process for tests and simulated
//! runs.

use async_trait::async_trait;
use thiserror::Error;

use bakery_types::{CreateImageRequest, ResourceHandle, ResourceId, ResourceMetadata, ResourceStatus};

mod memory;

pub use memory::{InMemoryProvider, ProviderCall};

/// Failure reported by a remote provider call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("provider rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("resource '{0}' not found")]
    NotFound(ResourceId),

    #[error("could not decode provider response: {0}")]
    Decode(String),
}

/// Operations the engine needs from a cloud provider.
#[async_trait]
pub trait RemoteProvider: Send + Sync {
    /// Region the provider operates in; used to key created images.
    fn region(&self) -> &str;

    /// Starts asynchronous image creation and returns the freshly minted handle.
    async fn create_resource(&self, request: &CreateImageRequest) -> Result<ResourceHandle, ProviderError>;

    /// Current status of a resource, or `None` when the provider does not list it yet.
    async fn describe_resource(&self, id: &ResourceId) -> Result<Option<ResourceStatus>, ProviderError>;

    /// Deregisters a resource. `Ok(false)` means the provider declined without an error.
    async fn deregister_resource(&self, id: &ResourceId) -> Result<bool, ProviderError>;

    /// Canonical metadata for the given ids. Unknown ids are omitted.
    async fn list_resources(&self, ids: &[ResourceId]) -> Result<Vec<ResourceMetadata>, ProviderError>;
}
