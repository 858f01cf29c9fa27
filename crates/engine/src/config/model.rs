//! Data models for the build configuration.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use bakery_types::{ImageDeviceMapping, VirtualizationType};

use crate::{
    poll::{DEFAULT_NOT_FOUND_CHECKS, DEFAULT_POLL_INTERVAL, DEFAULT_WAIT_TIMEOUT},
    tracking::TrackingFailurePolicy,
};

/// Configuration for a single image build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    /// Name given to the created image.
    pub image_name: String,
    /// Region the build runs in; also the first half of the tracking key.
    pub region: String,
    /// Block device mappings attached to the image.
    #[serde(default)]
    pub block_devices: Vec<ImageDeviceMapping>,
    #[serde(default)]
    pub classification: ClassificationTags,
    #[serde(default)]
    pub poll: PollSettings,
    #[serde(default)]
    pub tracking: TrackingSettings,
}

impl BuildConfig {
    pub fn new(image_name: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            image_name: image_name.into(),
            region: region.into(),
            block_devices: Vec::new(),
            classification: ClassificationTags::default(),
            poll: PollSettings::default(),
            tracking: TrackingSettings::default(),
        }
    }

    /// Device mappings sent with the create request. Entries flagged
    /// `no_device` keep only the device name so the provider suppresses them.
    pub fn image_device_mappings(&self) -> Vec<ImageDeviceMapping> {
        self.block_devices
            .iter()
            .map(|device| {
                if device.no_device {
                    ImageDeviceMapping {
                        device_name: device.device_name.clone(),
                        no_device: true,
                        ..Default::default()
                    }
                } else {
                    device.clone()
                }
            })
            .collect()
    }
}

/// Tracking tags per virtualization type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ClassificationTags {
    #[serde(default = "default_paravirtual_tag")]
    pub paravirtual: String,
    #[serde(default = "default_hvm_tag")]
    pub hvm: String,
}

impl Default for ClassificationTags {
    fn default() -> Self {
        Self {
            paravirtual: default_paravirtual_tag(),
            hvm: default_hvm_tag(),
        }
    }
}

impl ClassificationTags {
    pub fn tag_for(&self, virtualization: VirtualizationType) -> &str {
        match virtualization {
            VirtualizationType::Paravirtual => &self.paravirtual,
            VirtualizationType::Hvm => &self.hvm,
        }
    }
}

fn default_paravirtual_tag() -> String {
    "pv".to_string()
}

fn default_hvm_tag() -> String {
    "hvm".to_string()
}

/// Readiness polling knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PollSettings {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_not_found_checks")]
    pub not_found_checks: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            timeout_secs: default_timeout_secs(),
            not_found_checks: default_not_found_checks(),
        }
    }
}

impl PollSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL.as_secs()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_WAIT_TIMEOUT.as_secs()
}

fn default_not_found_checks() -> u32 {
    DEFAULT_NOT_FOUND_CHECKS
}

/// Tracking store location and failure handling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TrackingSettings {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default)]
    pub on_failure: TrackingFailurePolicy,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            on_failure: TrackingFailurePolicy::default(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("bakery.db")
}
