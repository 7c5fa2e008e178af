//! Object-detection stage: one combined detect+extract call, then
//! per-image persist.

use std::collections::HashSet;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::app_state::PipelineContext;
use crate::models::asset::{BoundingBox, Domain, DomainPayload};
use crate::models::task::{BatchReport, FailedTaskRecord, FailureKind};
use crate::services::inference::DetectRequest;

use super::{consolidator, PipelineError};

fn object_boxes(boxes: &[[f32; 4]], confidences: &[f32], objects: &[String]) -> Vec<BoundingBox> {
    boxes
        .iter()
        .enumerate()
        .map(|(i, coords)| BoundingBox {
            coords: *coords,
            confidence: confidences.get(i).copied().unwrap_or(0.0),
            class_name: objects.get(i).cloned().unwrap_or_else(|| "object".to_string()),
        })
        .collect()
}

pub async fn run(
    ctx: &PipelineContext,
    task_id: Uuid,
    asset_ids: &[String],
) -> Result<BatchReport, PipelineError> {
    let mut errors = Vec::new();
    info!(task_id = %task_id, count = asset_ids.len(), "Processing object-detection batch");

    let req = DetectRequest {
        idx: asset_ids.to_vec(),
        lmdb_path: ctx.settings.staging_root.clone(),
    };
    let response = match ctx.inference.detect_objects(&req).await {
        Ok(r) => r,
        Err(e) => {
            error!(task_id = %task_id, error = %e, "Object-detection request failed");
            ctx.failures.record(&FailedTaskRecord::new(
                task_id,
                FailureKind::ObjectDetect,
                asset_ids.to_vec(),
                Domain::ObjectDetection,
                e.to_string(),
            ))?;
            return Ok(BatchReport::failure("object_detection detection failed", errors));
        }
    };

    let mut saved = 0usize;
    let mut seen: HashSet<&str> = HashSet::new();
    for result in &response {
        if !asset_ids.iter().any(|id| *id == result.idx) {
            warn!(asset_id = %result.idx, "Object-detection response for an id outside the batch, skipping");
            continue;
        }
        seen.insert(result.idx.as_str());

        let objects = result.objects.clone().unwrap_or_default();
        if objects.is_empty() && result.boxes.is_empty() {
            errors.push(format!("No objects detected in image {}", result.idx));
            continue;
        }

        let boxes = object_boxes(&result.boxes, &result.confidences, &objects);
        match consolidator::apply(
            ctx,
            &result.idx,
            boxes,
            DomainPayload::ObjectsDet(objects),
            &[],
        )
        .await
        {
            Ok(()) => saved += 1,
            Err(e) => errors.push(format!("Error processing image {}: {e}", result.idx)),
        }
    }

    for id in asset_ids {
        if !seen.contains(id.as_str()) {
            errors.push(format!("No objects detected in image {id}"));
        }
    }

    if saved == 0 {
        return Ok(BatchReport::failure("object_detection detection failed", errors));
    }
    if ctx.settings.abort_on_partial_failure && !errors.is_empty() {
        return Ok(BatchReport::failure("object_detection batch had failures", errors));
    }
    Ok(BatchReport::success(errors))
}
