//! # SQLite tracking store
//!
//! [`SqliteTrackingStore`] keeps one row per (region, image class) in the
//! `bake_image` table and marks it ready with the latest image id once a bake
//! finishes.
//!
//! Connections are opened lazily, so a missing or unreadable database only
//! surfaces when an update is attempted. Each update reports which stage
//! failed: opening a connection, preparing the statement, or executing it.
//! An update that matches no row is a failure too.
//!
//! # Examples
//!
//! ```ignore
//! use bakery_store::SqliteTrackingStore;
//!
//! let store = SqliteTrackingStore::open("/var/lib/bakery/bakery.db")?;
//! ```

use std::{path::Path, str::FromStr};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    Executor, Row, Statement,
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow},
};
use tracing::{debug, info};

use bakery_engine::{TrackingError, TrackingStore};
use bakery_types::{TrackingKey, TrackingRecord, TrackingUpdate};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS bake_image (
        region TEXT NOT NULL,
        image_type TEXT NOT NULL,
        image_status INTEGER NOT NULL DEFAULT 0,
        image_id TEXT,
        updated_at TEXT,
        PRIMARY KEY (region, image_type)
    )
"#;

const UPDATE_RECORD: &str = r#"
    UPDATE bake_image
    SET image_status = ?, image_id = ?, updated_at = ?
    WHERE region = ? AND image_type = ?
"#;

/// Tracking store backed by a SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteTrackingStore {
    pool: SqlitePool,
}

impl SqliteTrackingStore {
    /// Points the store at an existing database. Nothing is opened yet.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let options = SqliteConnectOptions::new().filename(path.as_ref()).create_if_missing(false);
        Self {
            pool: SqlitePoolOptions::new().max_connections(1).connect_lazy_with(options),
        }
    }

    /// Opens (creating if needed) the database at `path` and ensures the schema exists.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self, TrackingError> {
        let options = SqliteConnectOptions::new().filename(path.as_ref()).create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|error| TrackingError::Open(error.to_string()))?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Private in-memory database, mostly for tests.
    pub async fn in_memory() -> Result<Self, TrackingError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(|error| TrackingError::Open(error.to_string()))?;
        // One long-lived connection: every new in-memory connection is a new database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|error| TrackingError::Open(error.to_string()))?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub async fn ensure_schema(&self) -> Result<(), TrackingError> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|error| TrackingError::Execute(error.to_string()))?;
        Ok(())
    }

    /// Adds a not-ready row for `key` unless one already exists.
    pub async fn insert_record(&self, key: &TrackingKey) -> Result<(), TrackingError> {
        sqlx::query("INSERT OR IGNORE INTO bake_image (region, image_type, image_status) VALUES (?, ?, 0)")
            .bind(key.region.as_str())
            .bind(key.resource_type.as_str())
            .execute(&self.pool)
            .await
            .map_err(|error| TrackingError::Execute(error.to_string()))?;
        debug!(tracking_key = %key, "tracking row seeded");
        Ok(())
    }

    pub async fn fetch_record(&self, key: &TrackingKey) -> Result<Option<TrackingRecord>, TrackingError> {
        let row = sqlx::query(
            r#"
            SELECT region, image_type, image_status, image_id, updated_at
            FROM bake_image
            WHERE region = ? AND image_type = ?
            "#,
        )
        .bind(key.region.as_str())
        .bind(key.resource_type.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| TrackingError::Execute(error.to_string()))?;

        row.map(|row| record_from_row(&row)).transpose()
    }
}

fn record_from_row(row: &SqliteRow) -> Result<TrackingRecord, TrackingError> {
    let decode = |error: sqlx::Error| TrackingError::Execute(error.to_string());
    let updated_at = row
        .try_get::<Option<String>, _>("updated_at")
        .map_err(decode)?
        .and_then(|value| DateTime::parse_from_rfc3339(&value).ok())
        .map(|value| value.with_timezone(&Utc));

    Ok(TrackingRecord {
        key: TrackingKey::new(
            row.try_get::<String, _>("region").map_err(decode)?,
            row.try_get::<String, _>("image_type").map_err(decode)?,
        ),
        ready: row.try_get::<i64, _>("image_status").map_err(decode)? != 0,
        resource_id: row.try_get::<Option<String>, _>("image_id").map_err(decode)?.map(Into::into),
        updated_at,
    })
}

#[async_trait]
impl TrackingStore for SqliteTrackingStore {
    async fn update_record(&self, key: &TrackingKey, update: &TrackingUpdate) -> Result<u64, TrackingError> {
        let mut connection = self.pool.acquire().await.map_err(|error| TrackingError::Open(error.to_string()))?;

        let statement = (&mut *connection)
            .prepare(UPDATE_RECORD)
            .await
            .map_err(|error| TrackingError::Prepare(error.to_string()))?;

        let result = statement
            .query()
            .bind(i64::from(update.ready))
            .bind(update.resource_id.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(key.region.as_str())
            .bind(key.resource_type.as_str())
            .execute(&mut *connection)
            .await
            .map_err(|error| TrackingError::Execute(error.to_string()))?;

        let rows = result.rows_affected();
        if rows == 0 {
            return Err(TrackingError::NoRowsAffected(key.clone()));
        }
        info!(tracking_key = %key, image_id = %update.resource_id, rows, "tracking record updated");
        Ok(rows)
    }
}
