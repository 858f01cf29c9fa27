//! Tracking records correlate a (region, image class) pair with the image
//! most recently baked for it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ResourceId;

/// Key addressing a tracking row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackingKey {
    pub region: String,
    /// Classification tag derived from the image's virtualization type, e.g. `pv` or `hvm`.
    pub resource_type: String,
}

impl TrackingKey {
    pub fn new(region: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            resource_type: resource_type.into(),
        }
    }
}

impl fmt::Display for TrackingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.region, self.resource_type)
    }
}

/// Fields written when an image becomes ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingUpdate {
    pub ready: bool,
    pub resource_id: ResourceId,
}

/// A tracking row as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingRecord {
    pub key: TrackingKey,
    pub ready: bool,
    pub resource_id: Option<ResourceId>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl TrackingRecord {
    /// A row that exists but has not been baked yet.
    pub fn empty(key: TrackingKey) -> Self {
        Self {
            key,
            ready: false,
            resource_id: None,
            updated_at: None,
        }
    }
}
