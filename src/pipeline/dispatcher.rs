//! Batch dispatcher: splits asset-id lists into fixed-size chunks, stages
//! each chunk's bytes in one atomic transaction, and chains the chunk into
//! its domain's processing queue.

use tracing::{debug, error, info};
use uuid::Uuid;

use crate::app_state::PipelineContext;
use crate::db::AssetStore;
use crate::models::asset::{Asset, Domain};
use crate::models::task::{
    BatchReport, ChunkHandle, FailedTaskRecord, FailureKind, QueuedTask, StagedEntry, SubmitReport,
};
use crate::services::blobstore::BlobStore;
use crate::services::queue::TaskQueue;
use crate::store::CF_RAW;

use super::PipelineError;

/// Split `asset_ids` into fixed-size chunks and submit each as a cache-write
/// task. Chunk boundaries depend only on position, never on content.
///
/// A per-id read failure from the blob store is recorded as an error string
/// and the id is excluded from its chunk's cache write; it does not abort
/// the chunk.
pub async fn submit_batch(
    ctx: &PipelineContext,
    asset_ids: &[String],
    domain: Domain,
) -> Result<SubmitReport, PipelineError> {
    let mut report = SubmitReport::default();

    for chunk in asset_ids.chunks(ctx.settings.chunk_size) {
        let mut entries = Vec::with_capacity(chunk.len());
        let mut staged_ids = Vec::with_capacity(chunk.len());

        for id in chunk {
            match ctx.blobs.get(id).await {
                Ok(bytes) => {
                    entries.push(StagedEntry {
                        asset_id: id.clone(),
                        bytes,
                    });
                    staged_ids.push(id.clone());
                }
                Err(e) => {
                    report.errors.push(format!("Error reading {id}: {e}"));
                }
            }
        }

        if entries.is_empty() {
            continue;
        }

        let task_id = Uuid::new_v4();
        let task = QueuedTask::WriteCacheAndProcess {
            task_id,
            domain,
            entries,
        };
        ctx.queue.enqueue(&task).await?;
        report.chunks.push(ChunkHandle {
            task_id,
            asset_ids: staged_ids,
        });
    }

    info!(
        domain = %domain,
        chunks = report.chunks.len(),
        errors = report.errors.len(),
        "Submitted batch"
    );
    Ok(report)
}

/// Ingestion stage: create asset records for ids not seen before, then
/// submit the batch for staging. This is the stage `upload…` ledger entries
/// are routed back to.
pub async fn run_ingest(
    ctx: &PipelineContext,
    task_id: Uuid,
    asset_ids: &[String],
    domain: Domain,
) -> Result<BatchReport, PipelineError> {
    let mut errors = Vec::new();

    for id in asset_ids {
        match ctx.assets.exists(id).await {
            Ok(true) => {
                debug!(asset_id = %id, "Asset already exists, skipping");
                continue;
            }
            Ok(false) => {
                let mut asset = Asset::new(id.clone(), domain);
                asset.blob_ref = Some(id.clone());
                if let Err(e) = ctx.assets.create(&asset).await {
                    errors.push(format!("Error creating asset {id}: {e}"));
                }
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Asset store unavailable during ingest");
                ctx.failures.record(&FailedTaskRecord::new(
                    task_id,
                    FailureKind::Upload,
                    asset_ids.to_vec(),
                    domain,
                    e.to_string(),
                ))?;
                return Ok(BatchReport::failure("upload failed", errors));
            }
        }
    }

    match submit_batch(ctx, asset_ids, domain).await {
        Ok(submit) => {
            errors.extend(submit.errors);
            Ok(BatchReport::success(errors))
        }
        Err(e) => {
            error!(task_id = %task_id, error = %e, "Batch submission failed during ingest");
            ctx.failures.record(&FailedTaskRecord::new(
                task_id,
                FailureKind::Upload,
                asset_ids.to_vec(),
                domain,
                e.to_string(),
            ))?;
            Ok(BatchReport::failure("upload failed", errors))
        }
    }
}

/// Cache-write stage: write the chunk's bytes to the staging store in one
/// transaction, then enqueue the chained processing task once the commit
/// has returned. A half-written chunk can never reach processing.
pub async fn run_write_cache_and_process(
    ctx: &PipelineContext,
    task_id: Uuid,
    domain: Domain,
    entries: Vec<StagedEntry>,
) -> Result<BatchReport, PipelineError> {
    if entries.is_empty() {
        error!(task_id = %task_id, "Cache is empty or invalid");
        return Ok(BatchReport::failure("cache is empty or invalid", vec![]));
    }

    let asset_ids: Vec<String> = entries.iter().map(|e| e.asset_id.clone()).collect();

    if let Err(e) = ctx.staging.put_batch(
        CF_RAW,
        entries.iter().map(|e| (e.asset_id.as_str(), e.bytes.as_slice())),
    ) {
        error!(task_id = %task_id, error = %e, "Error writing cache");
        ctx.failures.record(&FailedTaskRecord::new(
            task_id,
            FailureKind::Upload,
            asset_ids,
            domain,
            e.to_string(),
        ))?;
        return Ok(BatchReport::failure(format!("error writing cache: {e}"), vec![]));
    }
    debug!(task_id = %task_id, count = entries.len(), "Cache written");

    // The staging transaction is committed; the chain is now safe.
    let process = QueuedTask::ProcessBatch {
        task_id: Uuid::new_v4(),
        asset_ids,
        domain,
    };
    ctx.queue.enqueue(&process).await?;

    Ok(BatchReport::success(vec![]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::task::QueueName;
    use crate::pipeline::testutil::{harness, StubInference};

    async fn seed_blobs(h: &crate::pipeline::testutil::TestHarness, ids: &[&str]) {
        for id in ids {
            h.blobs.put(id, b"image-bytes", "image/jpeg").await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_chunk_count_is_ceil_n_over_c() {
        let h = harness(StubInference::default());
        let ids: Vec<String> = (0..5).map(|i| format!("img_{i}.jpg")).collect();
        seed_blobs(&h, &ids.iter().map(String::as_str).collect::<Vec<_>>()).await;

        // chunk_size = 2 in the harness: 5 ids -> 3 chunks
        let report = submit_batch(&h.ctx, &ids, Domain::Ocr).await.unwrap();
        assert_eq!(report.chunks.len(), 3);
        assert!(report.errors.is_empty());
        assert_eq!(
            h.queue.depth(QueueName::WriteCacheAndProcess).await.unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn test_missing_blob_is_excluded_not_fatal() {
        let h = harness(StubInference::default());
        seed_blobs(&h, &["img_0.jpg"]).await;
        let ids = vec!["img_0.jpg".to_string(), "img_missing.jpg".to_string()];

        let report = submit_batch(&h.ctx, &ids, Domain::Face).await.unwrap();
        assert_eq!(report.chunks.len(), 1);
        assert_eq!(report.chunks[0].asset_ids, vec!["img_0.jpg"]);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("img_missing.jpg"));
    }

    #[tokio::test]
    async fn test_cache_write_stages_whole_chunk_then_chains() {
        let h = harness(StubInference::default());
        let entries: Vec<StagedEntry> = (0..2)
            .map(|i| StagedEntry {
                asset_id: format!("img_{i}.jpg"),
                bytes: vec![i as u8; 8],
            })
            .collect();

        let report =
            run_write_cache_and_process(&h.ctx, Uuid::new_v4(), Domain::Ocr, entries.clone())
                .await
                .unwrap();
        assert_eq!(report.status, crate::models::task::BatchStatus::Success);

        // Every id in the chunk is retrievable, never a partial subset.
        for entry in &entries {
            assert_eq!(
                h.ctx.staging.get(CF_RAW, &entry.asset_id).unwrap(),
                entry.bytes
            );
        }

        // The chained processing task is enqueued after the commit.
        let chained = h
            .queue
            .dequeue(QueueName::ImageProcessing)
            .await
            .unwrap()
            .expect("processing task should be chained");
        match chained {
            QueuedTask::ProcessBatch {
                asset_ids, domain, ..
            } => {
                assert_eq!(asset_ids, vec!["img_0.jpg", "img_1.jpg"]);
                assert_eq!(domain, Domain::Ocr);
            }
            other => panic!("unexpected task: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_cache_chunk_is_rejected() {
        let h = harness(StubInference::default());
        let report = run_write_cache_and_process(&h.ctx, Uuid::new_v4(), Domain::Face, vec![])
            .await
            .unwrap();
        assert_eq!(report.status, crate::models::task::BatchStatus::Failure);
        assert_eq!(
            h.queue.depth(QueueName::ImageProcessing).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_ingest_creates_assets_and_skips_duplicates() {
        let h = harness(StubInference::default());
        seed_blobs(&h, &["img_0.jpg", "img_1.jpg"]).await;
        let ids = vec!["img_0.jpg".to_string(), "img_1.jpg".to_string()];

        let report = run_ingest(&h.ctx, Uuid::new_v4(), &ids, Domain::Face)
            .await
            .unwrap();
        assert_eq!(report.status, crate::models::task::BatchStatus::Success);
        assert!(h.assets.exists("img_0.jpg").await.unwrap());

        // Second ingest of the same ids must not error on duplicates.
        let report = run_ingest(&h.ctx, Uuid::new_v4(), &ids, Domain::Face)
            .await
            .unwrap();
        assert_eq!(report.status, crate::models::task::BatchStatus::Success);
        assert!(report.errors.is_empty());
    }
}
