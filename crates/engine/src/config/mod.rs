//! Build configuration.
//! This module handles parsing, validation, and lookup of the YAML file
//! describing one image build (by default `~/.config/bakery/build.yaml`).

mod io;
mod model;
mod validation;

pub use io::{default_config_path, load_config_from_path, parse_config};
pub use model::{BuildConfig, ClassificationTags, PollSettings, TrackingSettings};
pub use validation::{MAX_WAIT_TIMEOUT_SECS, ValidationError, validate_config};
