use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::str::FromStr;

use crate::models::asset::{Asset, AssetStatus, BoundingBox, Domain, DomainPayload, FaceEmbedding};

use super::{AssetStore, AssetStoreError};

/// PostgreSQL-backed asset store.
pub struct PgAssetStore {
    pool: PgPool,
}

impl PgAssetStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_asset(row: &sqlx::postgres::PgRow) -> Result<Asset, AssetStoreError> {
        let domain_str: String = row.try_get("domain")?;
        let domain = Domain::from_str(&domain_str).unwrap_or(Domain::Face);
        let status_str: String = row.try_get("status")?;

        let boxes_json: serde_json::Value = row.try_get("bounding_boxes")?;
        let payload_json: serde_json::Value = row.try_get("payload")?;
        let values: Vec<String> = serde_json::from_value(payload_json)?;
        let payload = match domain {
            Domain::Face => DomainPayload::Faces(values),
            Domain::Ocr => DomainPayload::Texts(values),
            Domain::ObjectDetection => DomainPayload::ObjectsDet(values),
        };

        Ok(Asset {
            id: row.try_get("id")?,
            domain,
            status: AssetStatus::from_str_or_default(&status_str),
            created_at: row.try_get("created_at")?,
            bounding_boxes: serde_json::from_value(boxes_json)?,
            blob_ref: row.try_get("blob_ref")?,
            is_new: row.try_get("is_new")?,
            payload,
        })
    }
}

#[async_trait]
impl AssetStore for PgAssetStore {
    async fn create(&self, asset: &Asset) -> Result<(), AssetStoreError> {
        sqlx::query(
            r#"
            INSERT INTO assets (id, domain, status, created_at, bounding_boxes, payload, blob_ref, is_new)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&asset.id)
        .bind(asset.domain.to_string())
        .bind(asset.status.as_str())
        .bind(asset.created_at)
        .bind(serde_json::to_value(&asset.bounding_boxes)?)
        .bind(serde_json::to_value(asset.payload.values())?)
        .bind(&asset.blob_ref)
        .bind(asset.is_new)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Asset>, AssetStoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, domain, status, created_at, bounding_boxes, payload, blob_ref, is_new
            FROM assets
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::row_to_asset(&r)).transpose()
    }

    async fn exists(&self, id: &str) -> Result<bool, AssetStoreError> {
        let row = sqlx::query("SELECT 1 AS one FROM assets WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn set_status(&self, id: &str, status: AssetStatus) -> Result<(), AssetStoreError> {
        // Forward-only: the CASE keeps later statuses in place when a stale
        // retry tries to move backwards. `error` always wins.
        let result = sqlx::query(
            r#"
            UPDATE assets
            SET status = CASE
                    WHEN $1 = 'error' THEN $1
                    WHEN ARRAY_POSITION(ARRAY['uploaded','processing','result_saved','completed'], status)
                         < ARRAY_POSITION(ARRAY['uploaded','processing','result_saved','completed'], $1)
                    THEN $1
                    ELSE status
                END,
                updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(status.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AssetStoreError::NotFound { id: id.to_string() });
        }
        Ok(())
    }

    async fn set_blob_ref(&self, id: &str, blob_ref: &str) -> Result<(), AssetStoreError> {
        let result = sqlx::query("UPDATE assets SET blob_ref = $1, updated_at = NOW() WHERE id = $2")
            .bind(blob_ref)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AssetStoreError::NotFound { id: id.to_string() });
        }
        Ok(())
    }

    async fn apply_result(
        &self,
        id: &str,
        boxes: &[BoundingBox],
        payload: &DomainPayload,
    ) -> Result<(), AssetStoreError> {
        // Last-write-wins replacement in one statement; never moves status
        // back past `result_saved`.
        let result = sqlx::query(
            r#"
            UPDATE assets
            SET bounding_boxes = $1,
                payload = $2,
                status = CASE WHEN status = 'completed' THEN status ELSE 'result_saved' END,
                updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(serde_json::to_value(boxes)?)
        .bind(serde_json::to_value(payload.values())?)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AssetStoreError::NotFound { id: id.to_string() });
        }
        Ok(())
    }

    async fn upsert_face_embedding(
        &self,
        embedding: &FaceEmbedding,
    ) -> Result<(), AssetStoreError> {
        sqlx::query(
            r#"
            INSERT INTO face_embeddings (face_id, embedding, blob_ref)
            VALUES ($1, $2, $3)
            ON CONFLICT (face_id) DO UPDATE
            SET embedding = EXCLUDED.embedding,
                blob_ref = EXCLUDED.blob_ref
            "#,
        )
        .bind(&embedding.face_id)
        .bind(serde_json::to_value(&embedding.embedding)?)
        .bind(&embedding.blob_ref)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_face_embedding(
        &self,
        face_id: &str,
    ) -> Result<Option<FaceEmbedding>, AssetStoreError> {
        let row = sqlx::query(
            "SELECT face_id, embedding, blob_ref FROM face_embeddings WHERE face_id = $1",
        )
        .bind(face_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            let embedding_json: serde_json::Value = r.try_get("embedding")?;
            Ok(FaceEmbedding {
                face_id: r.try_get("face_id")?,
                embedding: serde_json::from_value(embedding_json)?,
                blob_ref: r.try_get("blob_ref")?,
            })
        })
        .transpose()
    }

    async fn expire_new_flags(&self, cutoff: DateTime<Utc>) -> Result<u64, AssetStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE assets
            SET is_new = FALSE, updated_at = NOW()
            WHERE is_new = TRUE AND created_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
