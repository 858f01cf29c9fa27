//! Best-effort bookkeeping of baked images.
//!
//! A tracking store maps (region, image class) to the most recently baked
//! image id. Updates are a side channel: they are not transactional with the
//! provider and have no compensating action.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use bakery_types::{TrackingKey, TrackingRecord, TrackingUpdate};

/// One failure per stage of a tracking update.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackingError {
    #[error("failed to open the tracking store: {0}")]
    Open(String),

    #[error("preparing the update statement failed: {0}")]
    Prepare(String),

    #[error("update execution failed: {0}")]
    Execute(String),

    #[error("update affected no tracking record for {0}")]
    NoRowsAffected(TrackingKey),
}

/// What a step does when the tracking update fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TrackingFailurePolicy {
    /// Report the failure to the UI and log, then continue the step.
    #[default]
    Report,
    /// Treat the failure like any other fatal step error.
    Halt,
}

#[async_trait]
pub trait TrackingStore: Send + Sync {
    /// Marks the record for `key` with `update`; returns the number of rows changed.
    async fn update_record(&self, key: &TrackingKey, update: &TrackingUpdate) -> Result<u64, TrackingError>;
}

/// Tracking store held in memory, used by tests and simulated runs.
///
/// Like the SQL store, it only updates rows that already exist.
#[derive(Debug, Default)]
pub struct InMemoryTrackingStore {
    records: Mutex<IndexMap<TrackingKey, TrackingRecord>>,
    failure: Mutex<Option<TrackingError>>,
}

impl InMemoryTrackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-creates an empty row for `key`.
    pub fn with_record(self, key: TrackingKey) -> Self {
        self.lock_records().insert(key.clone(), TrackingRecord::empty(key));
        self
    }

    /// Every subsequent update fails with `error`.
    pub fn failing_with(self, error: TrackingError) -> Self {
        *self.failure.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(error);
        self
    }

    pub fn record(&self, key: &TrackingKey) -> Option<TrackingRecord> {
        self.lock_records().get(key).cloned()
    }

    fn lock_records(&self) -> std::sync::MutexGuard<'_, IndexMap<TrackingKey, TrackingRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl TrackingStore for InMemoryTrackingStore {
    async fn update_record(&self, key: &TrackingKey, update: &TrackingUpdate) -> Result<u64, TrackingError> {
        if let Some(error) = self.failure.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone() {
            return Err(error);
        }

        let mut records = self.lock_records();
        let Some(record) = records.get_mut(key) else {
            return Err(TrackingError::NoRowsAffected(key.clone()));
        };
        record.ready = update.ready;
        record.resource_id = Some(update.resource_id.clone());
        record.updated_at = Some(Utc::now());
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update() -> TrackingUpdate {
        TrackingUpdate {
            ready: true,
            resource_id: "img-1".into(),
        }
    }

    #[tokio::test]
    async fn updates_existing_rows_only() {
        let key = TrackingKey::new("eu-west-1", "hvm");
        let store = InMemoryTrackingStore::new().with_record(key.clone());

        assert_eq!(store.update_record(&key, &update()).await, Ok(1));
        let record = store.record(&key).unwrap();
        assert!(record.ready);
        assert_eq!(record.resource_id, Some("img-1".into()));

        let unknown = TrackingKey::new("eu-west-1", "pv");
        assert_eq!(
            store.update_record(&unknown, &update()).await,
            Err(TrackingError::NoRowsAffected(unknown.clone()))
        );
    }

    #[test]
    fn policy_defaults_to_report() {
        assert_eq!(TrackingFailurePolicy::default(), TrackingFailurePolicy::Report);
        let parsed: TrackingFailurePolicy = serde_yaml::from_str("halt").unwrap();
        assert_eq!(parsed, TrackingFailurePolicy::Halt);
    }
}
