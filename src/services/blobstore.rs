use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("blob '{key}' not found")]
    NotFound { key: String },

    #[error("blob store configuration error: {0}")]
    Config(String),
}

/// The durable image-library collaborator. The pipeline only ever puts and
/// gets whole byte blobs; everything else about the library is external.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), BlobError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError>;

    async fn delete(&self, key: &str) -> Result<(), BlobError>;
}

/// S3-compatible blob store client.
pub struct S3BlobStore {
    bucket: Box<Bucket>,
}

impl S3BlobStore {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, BlobError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials = Credentials::new(Some(access_key), Some(secret_key), None, None, None)
            .map_err(|e| BlobError::Config(e.to_string()))?;

        let bucket =
            Bucket::new(bucket_name, region, credentials).map_err(|e| BlobError::Config(e.to_string()))?;

        Ok(Self { bucket })
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), BlobError> {
        self.bucket
            .put_object_with_content_type(key, data, content_type)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        let response = self.bucket.get_object(key).await?;
        Ok(response.to_vec())
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        self.bucket.delete_object(key).await?;
        Ok(())
    }
}

/// In-process blob store for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, data: &[u8], _content_type: &str) -> Result<(), BlobError> {
        self.objects
            .write()
            .expect("blob store lock poisoned")
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        self.objects
            .read()
            .expect("blob store lock poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| BlobError::NotFound {
                key: key.to_string(),
            })
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        self.objects
            .write()
            .expect("blob store lock poisoned")
            .remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_round_trip() {
        let store = MemoryBlobStore::new();
        store.put("img_1.jpg", b"bytes", "image/jpeg").await.unwrap();
        assert_eq!(store.get("img_1.jpg").await.unwrap(), b"bytes");

        store.delete("img_1.jpg").await.unwrap();
        assert!(matches!(
            store.get("img_1.jpg").await,
            Err(BlobError::NotFound { .. })
        ));
    }
}
