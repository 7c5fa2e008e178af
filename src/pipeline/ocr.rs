//! OCR stage: one combined detect+extract call, then per-image persist.

use std::collections::HashSet;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::app_state::PipelineContext;
use crate::models::asset::{BoundingBox, Domain, DomainPayload};
use crate::models::task::{BatchReport, FailedTaskRecord, FailureKind};
use crate::services::inference::DetectRequest;

use super::{consolidator, PipelineError};

fn text_boxes(boxes: &[[f32; 4]], confidences: &[f32]) -> Vec<BoundingBox> {
    boxes
        .iter()
        .enumerate()
        .map(|(i, coords)| BoundingBox {
            coords: *coords,
            confidence: confidences.get(i).copied().unwrap_or(0.0),
            class_name: "text".to_string(),
        })
        .collect()
}

pub async fn run(
    ctx: &PipelineContext,
    task_id: Uuid,
    asset_ids: &[String],
) -> Result<BatchReport, PipelineError> {
    let mut errors = Vec::new();
    info!(task_id = %task_id, count = asset_ids.len(), "Processing OCR batch");

    let req = DetectRequest {
        idx: asset_ids.to_vec(),
        lmdb_path: ctx.settings.staging_root.clone(),
    };
    let response = match ctx.inference.run_ocr(&req).await {
        Ok(r) => r,
        Err(e) => {
            error!(task_id = %task_id, error = %e, "OCR request failed");
            ctx.failures.record(&FailedTaskRecord::new(
                task_id,
                FailureKind::OcrExtract,
                asset_ids.to_vec(),
                Domain::Ocr,
                e.to_string(),
            ))?;
            return Ok(BatchReport::failure("ocr detection failed", errors));
        }
    };

    let mut saved = 0usize;
    let mut seen: HashSet<&str> = HashSet::new();
    for result in &response {
        if !asset_ids.iter().any(|id| *id == result.idx) {
            warn!(asset_id = %result.idx, "OCR response for an id outside the batch, skipping");
            continue;
        }
        seen.insert(result.idx.as_str());

        let texts = result.texts.clone().unwrap_or_default();
        if texts.is_empty() && result.boxes.is_empty() {
            errors.push(format!("No text detected in image {}", result.idx));
            continue;
        }

        let boxes = text_boxes(&result.boxes, &result.confidences);
        match consolidator::apply(ctx, &result.idx, boxes, DomainPayload::Texts(texts), &[]).await
        {
            Ok(()) => saved += 1,
            Err(e) => errors.push(format!("Error processing image {}: {e}", result.idx)),
        }
    }

    // Ids the endpoint returned nothing for at all.
    for id in asset_ids {
        if !seen.contains(id.as_str()) {
            errors.push(format!("No text detected in image {id}"));
        }
    }

    if saved == 0 {
        return Ok(BatchReport::failure("ocr detection failed", errors));
    }
    if ctx.settings.abort_on_partial_failure && !errors.is_empty() {
        return Ok(BatchReport::failure("ocr batch had failures", errors));
    }
    Ok(BatchReport::success(errors))
}
