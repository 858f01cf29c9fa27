//! Concrete provisioning steps for image builds.

mod create_image;
mod source_image;

pub use create_image::CreateImageStep;
pub use source_image::SourceImageStep;
