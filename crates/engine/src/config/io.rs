//! Configuration IO helpers.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use dirs_next::config_dir;

use super::{BuildConfig, validate_config};

/// Returns the default path of the build configuration file.
///
/// `BAKERY_CONFIG_PATH` wins when set and non-blank.
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = env::var("BAKERY_CONFIG_PATH")
        && !path.trim().is_empty()
    {
        return PathBuf::from(path);
    }

    config_dir().unwrap_or_else(|| PathBuf::from(".")).join("bakery").join("build.yaml")
}

/// Loads, parses and validates the configuration at `path`.
pub fn load_config_from_path(path: &Path) -> Result<BuildConfig> {
    if !path.exists() {
        bail!("build configuration not found at {}", path.display());
    }

    let content = fs::read_to_string(path).with_context(|| format!("failed to read build configuration: {}", path.display()))?;
    parse_config(&content).with_context(|| format!("invalid build configuration: {}", path.display()))
}

/// Parses and validates configuration text.
pub fn parse_config(content: &str) -> Result<BuildConfig> {
    let config: BuildConfig = serde_yaml::from_str(content)?;
    validate_config(&config)?;
    Ok(config)
}
