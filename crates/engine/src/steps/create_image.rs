//! Creates an image from the build instance and waits for it to become ready.

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use tracing::{info, warn};

use bakery_types::{
    CreateImageRequest, ResourceId, ResourceMetadata, ResourceStatus, StepOutcome, TrackingKey, TrackingUpdate, VirtualizationType,
};

use crate::{
    error::StepError,
    poll::{ResourceStateRefresher, StateChangeConf, wait_for_state},
    state::{ExecutionContext, keys},
    step::{ProvisioningStep, halt_with},
    tracking::TrackingFailurePolicy,
};

/// Creates the image, records it, and deregisters it again if the run aborts.
///
/// The image id is remembered as soon as the provider returns it, before
/// waiting for readiness, so a half-created image is still deregistered when
/// the wait or any later step fails.
#[derive(Debug, Default)]
pub struct CreateImageStep {
    created: Option<ResourceId>,
    image: Option<ResourceMetadata>,
}

impl CreateImageStep {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the image created by the last run, if it got that far.
    pub fn created_image(&self) -> Option<&ResourceId> {
        self.created.as_ref()
    }

    /// Canonical metadata fetched after the image became ready.
    pub fn image(&self) -> Option<&ResourceMetadata> {
        self.image.as_ref()
    }

    async fn create(&mut self, ctx: &mut ExecutionContext) -> Result<(), StepError> {
        let config = ctx.get(&keys::CONFIG)?.clone();
        let provider = Arc::clone(ctx.get(&keys::PROVIDER)?);
        let tracking_store = Arc::clone(ctx.get(&keys::TRACKING_STORE)?);
        let ui = Arc::clone(ctx.get(&keys::UI)?);
        let source_image = ctx.get(&keys::SOURCE_IMAGE)?.clone();
        let instance_id = ctx.get(&keys::INSTANCE)?.clone();
        let region = provider.region().to_string();

        ui.say(&format!("Creating the image: {}", config.image_name));
        let request = CreateImageRequest {
            instance_id,
            name: config.image_name.clone(),
            block_devices: config.image_device_mappings(),
        };
        let handle = provider.create_resource(&request).await.map_err(StepError::Create)?;

        self.created = Some(handle.id.clone());
        match ctx.get_mut(&keys::IMAGES) {
            Some(images) => {
                images.insert(region.clone(), handle.id.clone());
            }
            None => ctx.put(keys::IMAGES, IndexMap::from([(region.clone(), handle.id.clone())])),
        }
        ui.message(&format!("Image: {}", handle.id));
        info!(step = %self.name(), image_id = %handle.id, %region, "image creation started");

        ui.say("Waiting for image to become ready...");
        let conf = StateChangeConf::new(vec![ResourceStatus::Pending], ResourceStatus::Available)
            .with_poll_interval(config.poll.interval())
            .with_timeout(config.poll.timeout())
            .with_not_found_checks(config.poll.not_found_checks);
        let refresher = ResourceStateRefresher::new(Arc::clone(&provider), handle.id.clone());
        let cancellation = ctx.cancellation().clone();
        wait_for_state(&conf, &refresher, &cancellation).await.map_err(StepError::Wait)?;

        let virtualization: VirtualizationType = source_image.virtualization_type.parse()?;
        let key = TrackingKey::new(region.as_str(), config.classification.tag_for(virtualization));

        ui.say("Image created. Updating the tracking store now.");
        let update = TrackingUpdate {
            ready: true,
            resource_id: handle.id.clone(),
        };
        match tracking_store.update_record(&key, &update).await {
            Ok(rows) => {
                ui.say(&format!("Updated tracking store with {rows} row(s) affected"));
                info!(step = %self.name(), tracking_key = %key, rows, "tracking record updated");
            }
            Err(error) if config.tracking.on_failure == TrackingFailurePolicy::Halt => {
                return Err(StepError::Tracking(error));
            }
            Err(error) => {
                // Reported but not fatal: the image exists and is ready either way.
                ui.error(&error.to_string());
                warn!(step = %self.name(), tracking_key = %key, %error, "tracking update failed; continuing");
                match ctx.get_mut(&keys::TRACKING_ERRORS) {
                    Some(errors) => errors.push(error),
                    None => ctx.put(keys::TRACKING_ERRORS, vec![error]),
                }
            }
        }

        let listed = provider
            .list_resources(std::slice::from_ref(&handle.id))
            .await
            .map_err(StepError::Describe)?;
        let image = listed
            .into_iter()
            .find(|image| image.id == handle.id)
            .ok_or_else(|| StepError::ImageNotListed(handle.id.clone()))?;

        ctx.put(keys::IMAGE, image.clone());
        self.image = Some(image);
        Ok(())
    }
}

#[async_trait]
impl ProvisioningStep for CreateImageStep {
    fn name(&self) -> &str {
        "create_image"
    }

    async fn run(&mut self, ctx: &mut ExecutionContext) -> StepOutcome {
        // Bookkeeping from an earlier run must not leak into this run's cleanup.
        self.created = None;
        self.image = None;
        match self.create(ctx).await {
            Ok(()) => StepOutcome::Continue,
            Err(error) => halt_with(ctx, self.name(), error),
        }
    }

    async fn cleanup(&mut self, ctx: &ExecutionContext) {
        let Some(image_id) = self.created.as_ref() else {
            return;
        };
        if !ctx.abort_reason().is_abort() {
            return;
        }
        let (Ok(provider), Ok(ui)) = (ctx.get(&keys::PROVIDER), ctx.get(&keys::UI)) else {
            warn!(step = %self.name(), image_id = %image_id, "provider or ui missing; image left in place");
            return;
        };

        ui.say("Deregistering the image because of cancellation or error...");
        match provider.deregister_resource(image_id).await {
            Ok(true) => info!(step = %self.name(), image_id = %image_id, "image deregistered"),
            Ok(false) => {
                ui.error("Error deregistering image, may still be around: provider declined the request");
                warn!(step = %self.name(), image_id = %image_id, "provider declined deregistration");
            }
            Err(error) => {
                ui.error(&format!("Error deregistering image, may still be around: {error}"));
                warn!(step = %self.name(), image_id = %image_id, %error, "deregistration failed");
            }
        }
    }
}
