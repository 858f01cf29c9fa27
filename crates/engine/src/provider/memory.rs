//! In-process provider used by tests and `bakery bake --simulate`.

use std::{collections::VecDeque, sync::Mutex};

use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;
use tracing::debug;

use bakery_types::{CreateImageRequest, ResourceHandle, ResourceId, ResourceMetadata, ResourceStatus};

use super::{ProviderError, RemoteProvider};

/// A call received by [`InMemoryProvider`], recorded in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    Create(CreateImageRequest),
    Describe(ResourceId),
    Deregister(ResourceId),
    List(Vec<ResourceId>),
}

type DescribeReply = Result<Option<ResourceStatus>, ProviderError>;

#[derive(Debug)]
struct Inner {
    images: IndexMap<ResourceId, ResourceMetadata>,
    next_id: u64,
    created_virtualization: String,
    describe_script: VecDeque<DescribeReply>,
    settle: bool,
    create_failure: Option<ProviderError>,
    deregister_reply: Result<bool, ProviderError>,
    list_failure: Option<ProviderError>,
    list_created: bool,
    created: Vec<ResourceId>,
    calls: Vec<ProviderCall>,
}

/// Scriptable provider keeping images in memory.
///
/// Without a script, a created image reports `pending` once and `available`
/// afterwards. Scripted describe replies are consumed first, in order, and a
/// scripted status also becomes the image's stored status.
#[derive(Debug)]
pub struct InMemoryProvider {
    region: String,
    inner: Mutex<Inner>,
}

impl InMemoryProvider {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            inner: Mutex::new(Inner {
                images: IndexMap::new(),
                next_id: 1,
                created_virtualization: "hvm".to_string(),
                describe_script: VecDeque::new(),
                settle: true,
                create_failure: None,
                deregister_reply: Ok(true),
                list_failure: None,
                list_created: true,
                created: Vec::new(),
                calls: Vec::new(),
            }),
        }
    }

    /// Seeds an existing image, typically the build's source image.
    pub fn with_image(self, metadata: ResourceMetadata) -> Self {
        self.lock().images.insert(metadata.id.clone(), metadata);
        self
    }

    pub fn with_created_virtualization(self, virtualization: impl Into<String>) -> Self {
        self.lock().created_virtualization = virtualization.into();
        self
    }

    /// Statuses returned by the next describe calls.
    pub fn with_statuses<I, S>(self, statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ResourceStatus>,
    {
        self.lock()
            .describe_script
            .extend(statuses.into_iter().map(|status| Ok(Some(status.into()))));
        self
    }

    pub fn with_describe_reply(self, reply: DescribeReply) -> Self {
        self.lock().describe_script.push_back(reply);
        self
    }

    /// Keeps created images at their stored status once the script runs out.
    pub fn never_settle(self) -> Self {
        self.lock().settle = false;
        self
    }

    pub fn failing_create(self, error: ProviderError) -> Self {
        self.lock().create_failure = Some(error);
        self
    }

    pub fn with_deregister_reply(self, reply: Result<bool, ProviderError>) -> Self {
        self.lock().deregister_reply = reply;
        self
    }

    pub fn failing_list(self, error: ProviderError) -> Self {
        self.lock().list_failure = Some(error);
        self
    }

    /// Leaves images created by this provider out of listings, as an
    /// eventually consistent listing would right after creation.
    pub fn omitting_from_listings(self) -> Self {
        self.lock().list_created = false;
        self
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().calls.clone()
    }

    pub fn deregister_calls(&self) -> Vec<ResourceId> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                ProviderCall::Deregister(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn image(&self, id: &ResourceId) -> Option<ResourceMetadata> {
        self.lock().images.get(id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means a test panicked mid-call; the data is still usable.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RemoteProvider for InMemoryProvider {
    fn region(&self) -> &str {
        &self.region
    }

    async fn create_resource(&self, request: &CreateImageRequest) -> Result<ResourceHandle, ProviderError> {
        let mut inner = self.lock();
        inner.calls.push(ProviderCall::Create(request.clone()));
        if let Some(error) = inner.create_failure.clone() {
            return Err(error);
        }

        let id = ResourceId::new(format!("img-{:08x}", inner.next_id));
        inner.next_id += 1;
        let metadata = ResourceMetadata {
            id: id.clone(),
            name: request.name.clone(),
            status: ResourceStatus::Pending,
            virtualization_type: inner.created_virtualization.clone(),
            block_devices: request.block_devices.clone(),
            created_at: Some(Utc::now()),
        };
        inner.images.insert(id.clone(), metadata);
        inner.created.push(id.clone());
        debug!(region = %self.region, image_id = %id, "simulated image created");

        Ok(ResourceHandle {
            id,
            status: ResourceStatus::Pending,
            virtualization_type: Some(inner.created_virtualization.clone()),
        })
    }

    async fn describe_resource(&self, id: &ResourceId) -> Result<Option<ResourceStatus>, ProviderError> {
        let mut inner = self.lock();
        inner.calls.push(ProviderCall::Describe(id.clone()));

        if let Some(reply) = inner.describe_script.pop_front() {
            if let (Ok(Some(status)), Some(image)) = (&reply, inner.images.get_mut(id)) {
                image.status = status.clone();
            }
            return reply;
        }

        let settle = inner.settle;
        let Some(image) = inner.images.get_mut(id) else {
            return Ok(None);
        };
        let current = image.status.clone();
        if settle && current == ResourceStatus::Pending {
            image.status = ResourceStatus::Available;
        }
        Ok(Some(current))
    }

    async fn deregister_resource(&self, id: &ResourceId) -> Result<bool, ProviderError> {
        let mut inner = self.lock();
        inner.calls.push(ProviderCall::Deregister(id.clone()));
        let reply = inner.deregister_reply.clone();
        if let Ok(true) = reply {
            if let Some(image) = inner.images.get_mut(id) {
                image.status = ResourceStatus::Deregistered;
            }
        }
        reply
    }

    async fn list_resources(&self, ids: &[ResourceId]) -> Result<Vec<ResourceMetadata>, ProviderError> {
        let mut inner = self.lock();
        inner.calls.push(ProviderCall::List(ids.to_vec()));
        if let Some(error) = inner.list_failure.clone() {
            return Err(error);
        }
        let list_created = inner.list_created;
        Ok(ids
            .iter()
            .filter(|id| list_created || !inner.created.contains(*id))
            .filter_map(|id| inner.images.get(id).cloned())
            .collect())
    }
}
