use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

use crate::models::asset::{Asset, AssetStatus, BoundingBox, DomainPayload, FaceEmbedding};

pub mod memory;
pub mod queries;

pub use memory::MemoryAssetStore;
pub use queries::PgAssetStore;

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

#[derive(Debug, thiserror::Error)]
pub enum AssetStoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("asset '{id}' not found")]
    NotFound { id: String },

    #[error("asset '{id}' already exists")]
    AlreadyExists { id: String },

    #[error("failed to decode stored record: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Persistent store of asset records, safe for concurrent access from
/// independent worker processes.
///
/// Every write is a single logical update so concurrent consolidations for
/// different ids never interleave on one id; re-applying a result is
/// last-write-wins, which makes supervisor double-retries harmless.
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Insert a new asset record. Inserting an id that already exists is an
    /// error; ingestion checks `exists` first and skips duplicates.
    async fn create(&self, asset: &Asset) -> Result<(), AssetStoreError>;

    async fn get(&self, id: &str) -> Result<Option<Asset>, AssetStoreError>;

    async fn exists(&self, id: &str) -> Result<bool, AssetStoreError>;

    /// Move the asset's status forward. Backward transitions are ignored
    /// (except to `Error`, which is reachable from anywhere).
    async fn set_status(&self, id: &str, status: AssetStatus) -> Result<(), AssetStoreError>;

    async fn set_blob_ref(&self, id: &str, blob_ref: &str) -> Result<(), AssetStoreError>;

    /// Apply a stage's outcome: replace bounding boxes and the domain
    /// payload, and flip status to `ResultSaved`, in one update.
    async fn apply_result(
        &self,
        id: &str,
        boxes: &[BoundingBox],
        payload: &DomainPayload,
    ) -> Result<(), AssetStoreError>;

    async fn upsert_face_embedding(&self, embedding: &FaceEmbedding)
        -> Result<(), AssetStoreError>;

    async fn get_face_embedding(
        &self,
        face_id: &str,
    ) -> Result<Option<FaceEmbedding>, AssetStoreError>;

    /// Maintenance: clear `is_new` on assets created before the cutoff.
    /// Returns the number of rows changed.
    async fn expire_new_flags(&self, cutoff: DateTime<Utc>) -> Result<u64, AssetStoreError>;
}
