//! Face stage: detect faces, crop and stage the face regions, embed them,
//! then persist embeddings and boxes through the consolidator.

use std::io::Cursor;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app_state::PipelineContext;
use crate::db::AssetStore;
use crate::models::asset::{AssetStatus, BoundingBox, Domain, DomainPayload, FaceEmbedding};
use crate::models::task::{BatchReport, FailedTaskRecord, FailureKind};
use crate::services::inference::{DetectRequest, FaceDetection};
use crate::store::{StoreError, CF_FACE_CROPS, CF_RAW};

use super::consolidator::{self, ConsolidateError};
use super::PipelineError;

/// Cropped face staged for the embed endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct FaceCrop {
    pub bytes: Vec<u8>,
    /// JSON-encoded landmarks from the detect endpoint, when present.
    pub landmarks: Option<String>,
}

/// Key of a cropped face in the intermediate cache.
pub fn face_key(asset_id: &str, face_index: usize) -> String {
    format!("{asset_id}_{face_index}")
}

fn crop_faces(bytes: &[u8], boxes: &[[f32; 4]]) -> Result<Vec<Vec<u8>>, image::ImageError> {
    let img = image::load_from_memory(bytes)?;
    let (width, height) = (img.width(), img.height());

    boxes
        .iter()
        .map(|&[x1, y1, x2, y2]| {
            let left = (x1.max(0.0) as u32).min(width.saturating_sub(1));
            let top = (y1.max(0.0) as u32).min(height.saturating_sub(1));
            let w = ((x2 - x1).max(1.0) as u32).min(width - left);
            let h = ((y2 - y1).max(1.0) as u32).min(height - top);

            let crop = img.crop_imm(left, top, w.max(1), h.max(1));
            let mut out = Cursor::new(Vec::new());
            image::DynamicImage::ImageRgb8(crop.to_rgb8())
                .write_to(&mut out, image::ImageFormat::Jpeg)?;
            Ok(out.into_inner())
        })
        .collect()
}

pub async fn run(
    ctx: &PipelineContext,
    task_id: Uuid,
    asset_ids: &[String],
) -> Result<BatchReport, PipelineError> {
    let mut errors = Vec::new();
    info!(task_id = %task_id, count = asset_ids.len(), "Processing face batch");

    let req = DetectRequest {
        idx: asset_ids.to_vec(),
        lmdb_path: ctx.settings.staging_root.clone(),
    };
    let mut detections = match ctx.inference.detect_faces(&req).await {
        Ok(d) => d,
        Err(e) => {
            error!(task_id = %task_id, error = %e, "Face detection request failed");
            ctx.failures.record(&FailedTaskRecord::new(
                task_id,
                FailureKind::FaceDetect,
                asset_ids.to_vec(),
                Domain::Face,
                e.to_string(),
            ))?;
            return Ok(BatchReport::failure("face detection failed", errors));
        }
    };

    if detections.len() != asset_ids.len() {
        warn!(
            expected = asset_ids.len(),
            got = detections.len(),
            "Detect response length mismatch, padding with empty results"
        );
        detections.resize_with(asset_ids.len(), FaceDetection::default);
    }

    // Crop each detected face out of the staged original and stage the
    // crops for the embed endpoint.
    for (id, det) in asset_ids.iter().zip(detections.iter_mut()) {
        if det.is_empty() {
            errors.push(format!("No face detected in image {id}"));
            continue;
        }

        let raw = match ctx.staging.get(CF_RAW, id) {
            Ok(bytes) => bytes,
            Err(StoreError::NotFound { .. }) => {
                errors.push(format!("No data found for image {id} in staging"));
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let crops = match crop_faces(&raw, &det.boxes) {
            Ok(crops) => crops,
            Err(e) => {
                warn!(asset_id = %id, error = %e, "Undecodable image, skipping");
                errors.push(format!("Error processing image {id}: {e}"));
                continue;
            }
        };

        let landmarks = det.landmarks.as_ref().map(|v| v.to_string());
        let mut staged = Vec::with_capacity(crops.len());
        for (i, crop) in crops.into_iter().enumerate() {
            let record = FaceCrop {
                bytes: crop,
                landmarks: landmarks.clone(),
            };
            let encoded =
                bincode::serialize(&record).map_err(|e| StoreError::Encode(e.to_string()))?;
            staged.push((face_key(id, i), encoded));
        }
        ctx.staging.put_batch(
            CF_FACE_CROPS,
            staged.iter().map(|(k, v)| (k.as_str(), v.as_slice())),
        )?;
        det.face_keys = staged.into_iter().map(|(k, _)| k).collect();

        if let Err(e) = ctx.assets.set_status(id, AssetStatus::Processing).await {
            debug!(asset_id = %id, error = %e, "Could not mark asset processing");
        }
    }

    if detections.iter().all(|d| d.face_keys.is_empty()) {
        return Ok(BatchReport::failure("face detection failed", errors));
    }

    let embed_resp = match ctx
        .inference
        .embed_faces(&detections, &ctx.settings.face_crop_root)
        .await
    {
        Ok(r) => r,
        Err(e) => {
            error!(task_id = %task_id, error = %e, "Face embedding request failed");
            ctx.failures.record(&FailedTaskRecord::new(
                task_id,
                FailureKind::FaceEmbed,
                asset_ids.to_vec(),
                Domain::Face,
                e.to_string(),
            ))?;
            return Ok(BatchReport::failure(format!("face embedding failed: {e}"), errors));
        }
    };

    let mut saved = 0usize;
    let mut persist_failed: Vec<String> = Vec::new();
    for (id, det) in asset_ids.iter().zip(&detections) {
        if det.face_keys.is_empty() {
            continue;
        }

        let mut face_ids = Vec::new();
        let mut embeddings = Vec::new();
        for key in &det.face_keys {
            match embed_resp.get(key) {
                Some(Some(raw)) => match ctx.index.projection().project(raw) {
                    Ok(projected) => {
                        face_ids.push(key.clone());
                        embeddings.push(FaceEmbedding {
                            face_id: key.clone(),
                            embedding: projected,
                            blob_ref: Some(key.clone()),
                        });
                    }
                    Err(e) => {
                        warn!(face = %key, error = %e, "Invalid embedding, skipping");
                        errors.push(format!("Invalid embedding for face {key}"));
                    }
                },
                _ => errors.push(format!("Unexpected value in response: {key}")),
            }
        }

        if face_ids.is_empty() {
            errors.push(format!("No embeddings produced for image {id}"));
            continue;
        }

        let boxes: Vec<BoundingBox> = det
            .boxes
            .iter()
            .enumerate()
            .map(|(i, coords)| BoundingBox {
                coords: *coords,
                confidence: det.confidences.get(i).copied().unwrap_or(0.0),
                class_name: "face".to_string(),
            })
            .collect();

        match consolidator::apply(ctx, id, boxes, DomainPayload::Faces(face_ids), &embeddings)
            .await
        {
            Ok(()) => saved += 1,
            Err(ConsolidateError::MissingAsset { .. }) => {
                errors.push(format!("Error processing image {id}: asset not found"));
            }
            Err(e) => {
                error!(asset_id = %id, error = %e, "Error saving face results");
                errors.push(format!("Error processing image {id}: {e}"));
                persist_failed.push(id.clone());
            }
        }
    }

    if !persist_failed.is_empty() {
        ctx.failures.record(&FailedTaskRecord::new(
            task_id,
            FailureKind::FacePersist,
            persist_failed,
            Domain::Face,
            "failed to save face results",
        ))?;
    }

    if saved == 0 {
        return Ok(BatchReport::failure("face processing failed", errors));
    }
    if ctx.settings.abort_on_partial_failure && !errors.is_empty() {
        return Ok(BatchReport::failure("face batch had failures", errors));
    }
    Ok(BatchReport::success(errors))
}
