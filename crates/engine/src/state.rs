//! Run-scoped execution context shared by every step.
//!
//! The context is a typed key/value registry. Each [`StateKey`] carries the
//! type of the value stored under it, so lookups never need a runtime cast
//! at the call site. The sequencer owns the context and lends it to exactly
//! one step at a time, which is why it carries no internal locking.

use std::{any::Any, fmt, marker::PhantomData, sync::Arc};

use indexmap::IndexMap;
use tokio::sync::watch;

use bakery_types::{AbortReason, ResourceId, ResourceMetadata};

use crate::{
    config::BuildConfig,
    error::{StateError, StepError},
    provider::RemoteProvider,
    tracking::{TrackingError, TrackingStore},
    ui::Ui,
};

/// Typed name of a context entry.
pub struct StateKey<T> {
    name: &'static str,
    _value: PhantomData<fn() -> T>,
}

impl<T> StateKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self { name, _value: PhantomData }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for StateKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for StateKey<T> {}

impl<T> fmt::Debug for StateKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StateKey").field(&self.name).finish()
    }
}

/// Well-known context keys.
pub mod keys {
    use super::*;

    pub const CONFIG: StateKey<BuildConfig> = StateKey::new("config");
    pub const PROVIDER: StateKey<Arc<dyn RemoteProvider>> = StateKey::new("provider");
    pub const TRACKING_STORE: StateKey<Arc<dyn TrackingStore>> = StateKey::new("tracking_store");
    pub const UI: StateKey<Arc<dyn Ui>> = StateKey::new("ui");
    /// Id of the image the build starts from.
    pub const SOURCE_IMAGE_ID: StateKey<ResourceId> = StateKey::new("source_image_id");
    /// Metadata of the source image, resolved by the source image step.
    pub const SOURCE_IMAGE: StateKey<ResourceMetadata> = StateKey::new("source_image");
    /// Running instance the image is captured from.
    pub const INSTANCE: StateKey<ResourceId> = StateKey::new("instance");
    /// Created image ids keyed by region.
    pub const IMAGES: StateKey<IndexMap<String, ResourceId>> = StateKey::new("images");
    /// Canonical metadata of the created image.
    pub const IMAGE: StateKey<ResourceMetadata> = StateKey::new("image");
    pub const ERROR: StateKey<StepError> = StateKey::new("error");
    /// Tracking failures that were reported without halting.
    pub const TRACKING_ERRORS: StateKey<Vec<TrackingError>> = StateKey::new("tracking_errors");

    pub(crate) const CANCELLED: StateKey<()> = StateKey::new("cancelled");
    pub(crate) const HALTED: StateKey<()> = StateKey::new("halted");
}

/// Externally settable flag observed by the sequencer and the poller.
#[derive(Debug, Clone)]
pub struct CancellationFlag {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for CancellationFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationFlag {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender: Arc::new(sender) }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives as long as `self`, so the channel cannot close here.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

type Entry = Box<dyn Any + Send + Sync>;

/// State bag for one pipeline run.
pub struct ExecutionContext {
    values: IndexMap<&'static str, Entry>,
    cancellation: CancellationFlag,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish()
    }
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::with_cancellation(CancellationFlag::new())
    }

    /// Creates a context observing an externally owned cancellation flag.
    pub fn with_cancellation(cancellation: CancellationFlag) -> Self {
        Self {
            values: IndexMap::new(),
            cancellation,
        }
    }

    /// Returns the value for `key`, failing when it was never set.
    pub fn get<T: 'static>(&self, key: &StateKey<T>) -> Result<&T, StateError> {
        self.values
            .get(key.name)
            .ok_or(StateError::MissingKey(key.name))?
            .downcast_ref::<T>()
            .ok_or(StateError::TypeMismatch(key.name))
    }

    pub fn get_optional<T: 'static>(&self, key: &StateKey<T>) -> Option<&T> {
        self.values.get(key.name).and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T: 'static>(&mut self, key: &StateKey<T>) -> Option<&mut T> {
        self.values.get_mut(key.name).and_then(|value| value.downcast_mut::<T>())
    }

    /// Stores `value` under `key`, replacing any earlier value.
    pub fn put<T: Send + Sync + 'static>(&mut self, key: StateKey<T>, value: T) {
        self.values.insert(key.name, Box::new(value));
    }

    pub fn remove<T: 'static>(&mut self, key: &StateKey<T>) -> Option<T> {
        let value = self.values.shift_remove(key.name)?;
        value.downcast::<T>().ok().map(|boxed| *boxed)
    }

    pub fn contains<T>(&self, key: &StateKey<T>) -> bool {
        self.values.contains_key(key.name)
    }

    pub fn cancellation(&self) -> &CancellationFlag {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn mark_cancelled(&mut self) {
        self.put(keys::CANCELLED, ());
    }

    pub fn mark_halted(&mut self) {
        self.put(keys::HALTED, ());
    }

    /// Cancellation wins over a halt when both markers are present.
    pub fn abort_reason(&self) -> AbortReason {
        if self.contains(&keys::CANCELLED) {
            AbortReason::Cancelled
        } else if self.contains(&keys::HALTED) {
            AbortReason::Halted
        } else {
            AbortReason::None
        }
    }

    pub fn record_error(&mut self, error: StepError) {
        self.put(keys::ERROR, error);
    }

    pub fn error(&self) -> Option<&StepError> {
        self.get_optional(&keys::ERROR)
    }
}
