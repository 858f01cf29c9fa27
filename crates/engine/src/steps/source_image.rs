//! Resolves the metadata of the image a build starts from.

use async_trait::async_trait;
use tracing::info;

use bakery_types::StepOutcome;

use crate::{
    error::StepError,
    state::{ExecutionContext, keys},
    step::{ProvisioningStep, halt_with},
};

/// Looks up `source_image_id` and stores the result under `source_image`.
#[derive(Debug, Default)]
pub struct SourceImageStep;

impl SourceImageStep {
    pub fn new() -> Self {
        Self
    }

    async fn inspect(&self, ctx: &mut ExecutionContext) -> Result<(), StepError> {
        let provider = ctx.get(&keys::PROVIDER)?.clone();
        let ui = ctx.get(&keys::UI)?.clone();
        let source_image_id = ctx.get(&keys::SOURCE_IMAGE_ID)?.clone();

        ui.say("Inspecting the source image...");
        let images = provider
            .list_resources(std::slice::from_ref(&source_image_id))
            .await
            .map_err(StepError::SourceLookup)?;
        let source_image = images
            .into_iter()
            .find(|image| image.id == source_image_id)
            .ok_or_else(|| StepError::SourceImageNotFound(source_image_id.clone()))?;

        ui.message(&format!("Found image ID: {}", source_image.id));
        info!(image_id = %source_image.id, virtualization = %source_image.virtualization_type, "source image resolved");
        ctx.put(keys::SOURCE_IMAGE, source_image);
        Ok(())
    }
}

#[async_trait]
impl ProvisioningStep for SourceImageStep {
    fn name(&self) -> &str {
        "source_image"
    }

    async fn run(&mut self, ctx: &mut ExecutionContext) -> StepOutcome {
        match self.inspect(ctx).await {
            Ok(()) => StepOutcome::Continue,
            Err(error) => halt_with(ctx, self.name(), error),
        }
    }

    async fn cleanup(&mut self, _ctx: &ExecutionContext) {}
}
