use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::asset::{Asset, AssetStatus, BoundingBox, DomainPayload, FaceEmbedding};

use super::{AssetStore, AssetStoreError};

/// In-process asset store for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryAssetStore {
    assets: RwLock<HashMap<String, Asset>>,
    embeddings: RwLock<HashMap<String, FaceEmbedding>>,
}

impl MemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of assets currently in the given status.
    pub fn count_with_status(&self, status: AssetStatus) -> usize {
        self.assets
            .read()
            .expect("asset store lock poisoned")
            .values()
            .filter(|a| a.status == status)
            .count()
    }
}

#[async_trait]
impl AssetStore for MemoryAssetStore {
    async fn create(&self, asset: &Asset) -> Result<(), AssetStoreError> {
        let mut assets = self.assets.write().expect("asset store lock poisoned");
        if assets.contains_key(&asset.id) {
            return Err(AssetStoreError::AlreadyExists {
                id: asset.id.clone(),
            });
        }
        assets.insert(asset.id.clone(), asset.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Asset>, AssetStoreError> {
        Ok(self
            .assets
            .read()
            .expect("asset store lock poisoned")
            .get(id)
            .cloned())
    }

    async fn exists(&self, id: &str) -> Result<bool, AssetStoreError> {
        Ok(self
            .assets
            .read()
            .expect("asset store lock poisoned")
            .contains_key(id))
    }

    async fn set_status(&self, id: &str, status: AssetStatus) -> Result<(), AssetStoreError> {
        let mut assets = self.assets.write().expect("asset store lock poisoned");
        let asset = assets
            .get_mut(id)
            .ok_or_else(|| AssetStoreError::NotFound { id: id.to_string() })?;
        if asset.status.can_transition(status) {
            asset.status = status;
        }
        Ok(())
    }

    async fn set_blob_ref(&self, id: &str, blob_ref: &str) -> Result<(), AssetStoreError> {
        let mut assets = self.assets.write().expect("asset store lock poisoned");
        let asset = assets
            .get_mut(id)
            .ok_or_else(|| AssetStoreError::NotFound { id: id.to_string() })?;
        asset.blob_ref = Some(blob_ref.to_string());
        Ok(())
    }

    async fn apply_result(
        &self,
        id: &str,
        boxes: &[BoundingBox],
        payload: &DomainPayload,
    ) -> Result<(), AssetStoreError> {
        let mut assets = self.assets.write().expect("asset store lock poisoned");
        let asset = assets
            .get_mut(id)
            .ok_or_else(|| AssetStoreError::NotFound { id: id.to_string() })?;
        asset.bounding_boxes = boxes.to_vec();
        asset.payload = payload.clone();
        if asset.status != AssetStatus::Completed {
            asset.status = AssetStatus::ResultSaved;
        }
        Ok(())
    }

    async fn upsert_face_embedding(
        &self,
        embedding: &FaceEmbedding,
    ) -> Result<(), AssetStoreError> {
        self.embeddings
            .write()
            .expect("asset store lock poisoned")
            .insert(embedding.face_id.clone(), embedding.clone());
        Ok(())
    }

    async fn get_face_embedding(
        &self,
        face_id: &str,
    ) -> Result<Option<FaceEmbedding>, AssetStoreError> {
        Ok(self
            .embeddings
            .read()
            .expect("asset store lock poisoned")
            .get(face_id)
            .cloned())
    }

    async fn expire_new_flags(&self, cutoff: DateTime<Utc>) -> Result<u64, AssetStoreError> {
        let mut assets = self.assets.write().expect("asset store lock poisoned");
        let mut expired = 0u64;
        for asset in assets.values_mut() {
            if asset.is_new && asset.created_at < cutoff {
                asset.is_new = false;
                expired += 1;
            }
        }
        Ok(expired)
    }
}
