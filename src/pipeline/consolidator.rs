//! Result consolidation: merge inference output onto the asset record,
//! write the durable result-ledger entry, and publish the notification.

use tracing::debug;

use crate::app_state::PipelineContext;
use crate::db::{AssetStore, AssetStoreError};
use crate::models::asset::{BoundingBox, DomainPayload, FaceEmbedding};
use crate::services::notifier::{NotifyError, ResultNotifier};
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ConsolidateError {
    #[error("asset '{id}' not found")]
    MissingAsset { id: String },

    #[error(transparent)]
    Assets(AssetStoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Notify(#[from] NotifyError),
}

impl From<AssetStoreError> for ConsolidateError {
    fn from(e: AssetStoreError) -> Self {
        match e {
            AssetStoreError::NotFound { id } => ConsolidateError::MissingAsset { id },
            other => ConsolidateError::Assets(other),
        }
    }
}

/// Apply one asset's stage outcome. Idempotent: re-applying the same
/// payload leaves the asset in the same final state (last-write-wins on the
/// embedded fields, not an append), so supervisor double-retries are safe.
///
/// The notification is published only after the asset write and the result
/// record are durable.
pub async fn apply(
    ctx: &PipelineContext,
    asset_id: &str,
    boxes: Vec<BoundingBox>,
    payload: DomainPayload,
    embeddings: &[FaceEmbedding],
) -> Result<(), ConsolidateError> {
    for embedding in embeddings {
        ctx.assets.upsert_face_embedding(embedding).await?;
    }

    ctx.assets.apply_result(asset_id, &boxes, &payload).await?;
    debug!(asset_id = %asset_id, "Result saved");

    let body = result_body(&payload, embeddings);
    ctx.results.record(asset_id, &body)?;
    ctx.notifier.publish(asset_id, &body).await?;

    Ok(())
}

/// The published payload. Face results carry the projected embeddings so
/// the similarity consumer never has to read them back out of the store.
fn result_body(payload: &DomainPayload, embeddings: &[FaceEmbedding]) -> serde_json::Value {
    match payload {
        DomainPayload::Faces(faces) => {
            let vectors: Vec<&Vec<f32>> = embeddings.iter().map(|e| &e.embedding).collect();
            serde_json::json!({"faces": faces, "embeddings": vectors})
        }
        DomainPayload::Texts(texts) => serde_json::json!({"texts": texts}),
        DomainPayload::ObjectsDet(objects) => serde_json::json!({"objects_det": objects}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::asset::{Asset, AssetStatus, Domain};
    use crate::pipeline::testutil::{harness, StubInference};

    fn sample_boxes() -> Vec<BoundingBox> {
        vec![BoundingBox {
            coords: [1.0, 2.0, 3.0, 4.0],
            confidence: 0.97,
            class_name: "face".into(),
        }]
    }

    #[tokio::test]
    async fn test_apply_flips_status_and_records_result() {
        let h = harness(StubInference::default());
        h.assets
            .create(&Asset::new("img_1.jpg", Domain::Face))
            .await
            .unwrap();

        apply(
            &h.ctx,
            "img_1.jpg",
            sample_boxes(),
            DomainPayload::Faces(vec!["img_1.jpg_0".into()]),
            &[FaceEmbedding {
                face_id: "img_1.jpg_0".into(),
                embedding: vec![0.5, 0.5],
                blob_ref: None,
            }],
        )
        .await
        .unwrap();

        let asset = h.assets.get("img_1.jpg").await.unwrap().unwrap();
        assert_eq!(asset.status, AssetStatus::ResultSaved);
        assert_eq!(asset.bounding_boxes, sample_boxes());
        assert_eq!(asset.payload.values(), ["img_1.jpg_0"]);

        let result = h.ctx.results.get("img_1.jpg").unwrap().unwrap();
        assert_eq!(result["faces"], serde_json::json!(["img_1.jpg_0"]));
    }

    #[tokio::test]
    async fn test_apply_twice_is_idempotent() {
        let h = harness(StubInference::default());
        h.assets
            .create(&Asset::new("img_1.jpg", Domain::Ocr))
            .await
            .unwrap();

        let payload = DomainPayload::Texts(vec!["hello".into(), "world".into()]);
        apply(&h.ctx, "img_1.jpg", sample_boxes(), payload.clone(), &[])
            .await
            .unwrap();
        let first = h.assets.get("img_1.jpg").await.unwrap().unwrap();

        apply(&h.ctx, "img_1.jpg", sample_boxes(), payload, &[])
            .await
            .unwrap();
        let second = h.assets.get("img_1.jpg").await.unwrap().unwrap();

        assert_eq!(first.status, second.status);
        assert_eq!(first.bounding_boxes, second.bounding_boxes);
        assert_eq!(first.payload, second.payload);
        // Payload replaced, not appended.
        assert_eq!(second.payload.values().len(), 2);
    }

    #[tokio::test]
    async fn test_apply_to_missing_asset_reports_missing() {
        let h = harness(StubInference::default());
        let err = apply(
            &h.ctx,
            "ghost.jpg",
            vec![],
            DomainPayload::Texts(vec![]),
            &[],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ConsolidateError::MissingAsset { .. }));
    }

    #[tokio::test]
    async fn test_notification_sent_after_durable_write() {
        use futures::StreamExt;

        let h = harness(StubInference::default());
        h.assets
            .create(&Asset::new("img_1.jpg", Domain::Ocr))
            .await
            .unwrap();

        let mut stream = h.notifier.subscribe().await.unwrap();
        apply(
            &h.ctx,
            "img_1.jpg",
            vec![],
            DomainPayload::Texts(vec!["hi".into()]),
            &[],
        )
        .await
        .unwrap();

        let event = stream.next().await.unwrap();
        assert_eq!(event.id, "res_img_1.jpg");
        // By the time the event arrives, both the asset and the result
        // record are already visible.
        let asset = h.assets.get("img_1.jpg").await.unwrap().unwrap();
        assert_eq!(asset.status, AssetStatus::ResultSaved);
        assert!(h.ctx.results.get("img_1.jpg").unwrap().is_some());
    }
}
