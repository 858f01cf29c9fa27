//! Remote resource model.
//!
//! The provider owns the authoritative copy of every resource. The engine
//! only ever holds a [`ResourceHandle`], a cached and possibly stale
//! reference refreshed through explicit provider calls.

use std::{convert::Infallible, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque identifier minted by the remote provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lifecycle status reported by the provider for a resource.
///
/// Statuses the engine does not model are preserved verbatim in
/// [`ResourceStatus::Other`] so they can be surfaced in error messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResourceStatus {
    Pending,
    Available,
    Failed,
    Deregistered,
    Other(String),
}

impl ResourceStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ResourceStatus::Pending => "pending",
            ResourceStatus::Available => "available",
            ResourceStatus::Failed => "failed",
            ResourceStatus::Deregistered => "deregistered",
            ResourceStatus::Other(raw) => raw.as_str(),
        }
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceStatus {
    type Err = Infallible;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Ok(match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => ResourceStatus::Pending,
            "available" => ResourceStatus::Available,
            "failed" => ResourceStatus::Failed,
            "deregistered" => ResourceStatus::Deregistered,
            _ => ResourceStatus::Other(raw.to_string()),
        })
    }
}

impl From<String> for ResourceStatus {
    fn from(raw: String) -> Self {
        match raw.parse() {
            Ok(status) => status,
            Err(never) => match never {},
        }
    }
}

impl From<&str> for ResourceStatus {
    fn from(raw: &str) -> Self {
        ResourceStatus::from(raw.to_string())
    }
}

impl From<ResourceStatus> for String {
    fn from(status: ResourceStatus) -> Self {
        status.as_str().to_string()
    }
}

/// Cached reference to a remote resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHandle {
    pub id: ResourceId,
    pub status: ResourceStatus,
    /// Virtualization tag reported by the provider, when known at creation time.
    #[serde(default)]
    pub virtualization_type: Option<String>,
}

/// Virtualization kind of a machine image.
///
/// The mapping from provider strings is exhaustive: anything other than the
/// two known kinds is rejected instead of falling back to a default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VirtualizationType {
    Paravirtual,
    Hvm,
}

/// Raised when a provider reports a virtualization kind with no mapping.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unmapped virtualization type '{0}'")]
pub struct UnmappedVirtualization(pub String);

impl FromStr for VirtualizationType {
    type Err = UnmappedVirtualization;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "paravirtual" => Ok(VirtualizationType::Paravirtual),
            "hvm" => Ok(VirtualizationType::Hvm),
            other => Err(UnmappedVirtualization(other.to_string())),
        }
    }
}

impl fmt::Display for VirtualizationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VirtualizationType::Paravirtual => f.write_str("paravirtual"),
            VirtualizationType::Hvm => f.write_str("hvm"),
        }
    }
}

/// Block device mapping attached to a created image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ImageDeviceMapping {
    pub device_name: String,
    #[serde(default)]
    pub snapshot_id: Option<String>,
    #[serde(default)]
    pub virtual_name: Option<String>,
    #[serde(default)]
    pub volume_type: Option<String>,
    #[serde(default)]
    pub volume_size: Option<u64>,
    #[serde(default)]
    pub iops: Option<u64>,
    #[serde(default)]
    pub delete_on_termination: bool,
    /// Suppresses the device from the image mapping entirely.
    #[serde(default)]
    pub no_device: bool,
}

/// Request payload for creating an image from a running instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateImageRequest {
    pub instance_id: ResourceId,
    pub name: String,
    #[serde(default)]
    pub block_devices: Vec<ImageDeviceMapping>,
}

/// Canonical representation of a resource as returned by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMetadata {
    pub id: ResourceId,
    pub name: String,
    pub status: ResourceStatus,
    /// Raw virtualization string; classify it with [`VirtualizationType::from_str`].
    pub virtualization_type: String,
    #[serde(default)]
    pub block_devices: Vec<ImageDeviceMapping>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}
