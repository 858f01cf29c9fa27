//! # Bakery Engine
//!
//! Step-based provisioning engine for baking machine images. A build is an
//! ordered list of [`ProvisioningStep`]s that share one [`ExecutionContext`].
//! The [`Sequencer`] runs them in order, stops on the first halt or on
//! cancellation, and then gives every started step a chance to undo its work,
//! most recent first.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use bakery_engine::{
//!     BuildConfig, ExecutionContext, InMemoryProvider, InMemoryTrackingStore, RecordingUi, RemoteProvider, Sequencer,
//!     TrackingStore, Ui, keys,
//!     steps::{CreateImageStep, SourceImageStep},
//! };
//! use bakery_types::{ResourceId, ResourceMetadata, ResourceStatus, TrackingKey};
//!
//! # tokio_test_runtime(async {
//! let provider = InMemoryProvider::new("eu-west-1").with_image(ResourceMetadata {
//!     id: "img-base".into(),
//!     name: "base".into(),
//!     status: ResourceStatus::Available,
//!     virtualization_type: "hvm".into(),
//!     block_devices: Vec::new(),
//!     created_at: None,
//! });
//! let store = InMemoryTrackingStore::new().with_record(TrackingKey::new("eu-west-1", "hvm"));
//!
//! let mut ctx = ExecutionContext::new();
//! ctx.put(keys::CONFIG, BuildConfig::new("web", "eu-west-1"));
//! ctx.put(keys::PROVIDER, Arc::new(provider) as Arc<dyn RemoteProvider>);
//! ctx.put(keys::TRACKING_STORE, Arc::new(store) as Arc<dyn TrackingStore>);
//! ctx.put(keys::UI, Arc::new(RecordingUi::new()) as Arc<dyn Ui>);
//! ctx.put(keys::SOURCE_IMAGE_ID, ResourceId::from("img-base"));
//! ctx.put(keys::INSTANCE, ResourceId::from("i-0abc"));
//!
//! let mut sequencer = Sequencer::new().with_step(SourceImageStep::new()).with_step(CreateImageStep::new());
//! let report = sequencer.run(&mut ctx).await;
//! assert!(report.succeeded());
//! # });
//! # fn tokio_test_runtime(future: impl std::future::Future<Output = ()>) {
//! #     tokio::runtime::Builder::new_current_thread().enable_time().start_paused(true).build().unwrap().block_on(future);
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **`state`**: typed context keys, the execution context and the cancellation flag
//! - **`sequencer`**: ordered execution, rollback and run reports
//! - **`poll`**: cancellable wait-for-target-state polling
//! - **`provider`**: the remote provider contract and an in-memory implementation
//! - **`tracking`**: the tracking store contract and an in-memory implementation
//! - **`steps`**: the concrete build steps
//! - **`config`**: YAML build configuration

pub mod config;
pub mod error;
pub mod poll;
pub mod provider;
pub mod sequencer;
pub mod state;
pub mod step;
pub mod steps;
pub mod tracking;
pub mod ui;

pub use config::{BuildConfig, ValidationError, default_config_path, load_config_from_path, parse_config, validate_config};
pub use error::{StateError, StepError};
pub use poll::{StateChangeConf, StateRefresh, WaitError, wait_for_state};
pub use provider::{InMemoryProvider, ProviderCall, ProviderError, RemoteProvider};
pub use sequencer::{RunReport, Sequencer, StepEvent, StepReport};
pub use state::{CancellationFlag, ExecutionContext, StateKey, keys};
pub use step::{ProvisioningStep, halt_with};
pub use tracking::{InMemoryTrackingStore, TrackingError, TrackingFailurePolicy, TrackingStore};
pub use ui::{ConsoleUi, RecordingUi, Ui};
