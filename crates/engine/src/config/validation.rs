//! Consistency checks run after the configuration is loaded.

use std::collections::HashSet;

use thiserror::Error;

use super::BuildConfig;

/// Longest accepted wait for an image to become ready: one week.
pub const MAX_WAIT_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("image_name must not be empty")]
    EmptyImageName,

    #[error("region must not be empty")]
    EmptyRegion,

    #[error("block device at index {0} has no device_name")]
    MissingDeviceName(usize),

    #[error("block device '{0}' is mapped more than once")]
    DuplicateDevice(String),

    #[error("poll.interval_secs must be greater than zero")]
    ZeroPollInterval,

    #[error("poll.timeout_secs ({timeout}) must not be shorter than poll.interval_secs ({interval})")]
    TimeoutShorterThanInterval { timeout: u64, interval: u64 },

    #[error("poll.timeout_secs ({timeout}) exceeds the maximum of {max} seconds")]
    TimeoutTooLong { timeout: u64, max: u64 },

    #[error("classification tags must be non-empty and distinct (paravirtual: '{paravirtual}', hvm: '{hvm}')")]
    AmbiguousClassification { paravirtual: String, hvm: String },
}

/// Validates a loaded [`BuildConfig`], returning the first problem found.
pub fn validate_config(config: &BuildConfig) -> Result<(), ValidationError> {
    if config.image_name.trim().is_empty() {
        return Err(ValidationError::EmptyImageName);
    }
    if config.region.trim().is_empty() {
        return Err(ValidationError::EmptyRegion);
    }

    let mut seen = HashSet::new();
    for (index, device) in config.block_devices.iter().enumerate() {
        let name = device.device_name.trim();
        if name.is_empty() {
            return Err(ValidationError::MissingDeviceName(index));
        }
        if !seen.insert(name) {
            return Err(ValidationError::DuplicateDevice(name.to_string()));
        }
    }

    let poll = &config.poll;
    if poll.interval_secs == 0 {
        return Err(ValidationError::ZeroPollInterval);
    }
    if poll.timeout_secs < poll.interval_secs {
        return Err(ValidationError::TimeoutShorterThanInterval {
            timeout: poll.timeout_secs,
            interval: poll.interval_secs,
        });
    }
    if poll.timeout_secs > MAX_WAIT_TIMEOUT_SECS {
        return Err(ValidationError::TimeoutTooLong {
            timeout: poll.timeout_secs,
            max: MAX_WAIT_TIMEOUT_SECS,
        });
    }

    let tags = &config.classification;
    if tags.paravirtual.trim().is_empty() || tags.hvm.trim().is_empty() || tags.paravirtual == tags.hvm {
        return Err(ValidationError::AmbiguousClassification {
            paravirtual: tags.paravirtual.clone(),
            hvm: tags.hvm.clone(),
        });
    }

    Ok(())
}
