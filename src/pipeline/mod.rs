//! The asynchronous batch-processing pipeline.
//!
//! The queue worker hands every dequeued task to [`run_task`]; the stage
//! ordering (cache write → detect → embed → persist → notify) is explicit
//! code here rather than broker callbacks, so it is testable without a live
//! broker.

use tracing::info;

use crate::app_state::PipelineContext;
use crate::db::AssetStoreError;
use crate::models::asset::Domain;
use crate::models::task::{BatchReport, BatchStatus, QueuedTask};
use crate::services::notifier::NotifyError;
use crate::services::queue::QueueError;
use crate::store::StoreError;

pub mod consolidator;
pub mod dispatcher;
pub mod face;
pub mod maintenance;
pub mod objdet;
pub mod ocr;
pub mod supervisor;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Assets(#[from] AssetStoreError),

    #[error(transparent)]
    Notify(#[from] NotifyError),

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Execute one dequeued task and return its structured report.
///
/// Transient upstream failures and missing data never escape as errors
/// here; they end up in the failure ledger or the report's error list. An
/// `Err` from this function is an infrastructure fault surfaced to the
/// worker loop.
pub async fn run_task(
    ctx: &PipelineContext,
    task: QueuedTask,
) -> Result<BatchReport, PipelineError> {
    let task_id = task.task_id();
    let start = std::time::Instant::now();
    let (kind, report) = match task {
        QueuedTask::IngestBatch {
            task_id,
            asset_ids,
            domain,
        } => (
            "ingest",
            dispatcher::run_ingest(ctx, task_id, &asset_ids, domain).await?,
        ),
        QueuedTask::WriteCacheAndProcess {
            task_id,
            domain,
            entries,
        } => (
            "write_cache",
            dispatcher::run_write_cache_and_process(ctx, task_id, domain, entries).await?,
        ),
        QueuedTask::ProcessBatch {
            task_id,
            asset_ids,
            domain,
        } => {
            let report = match domain {
                Domain::Face => face::run(ctx, task_id, &asset_ids).await?,
                Domain::Ocr => ocr::run(ctx, task_id, &asset_ids).await?,
                Domain::ObjectDetection => objdet::run(ctx, task_id, &asset_ids).await?,
            };
            ("process", report)
        }
    };

    metrics::counter!("pipeline_batches_total", "task" => kind).increment(1);
    if report.status == BatchStatus::Failure {
        metrics::counter!("pipeline_batches_failed", "task" => kind).increment(1);
    }
    metrics::histogram!("pipeline_task_seconds", "task" => kind)
        .record(start.elapsed().as_secs_f64());

    info!(
        task_id = %task_id,
        task = kind,
        status = ?report.status,
        error_count = report.errors.len(),
        "Task finished"
    );

    Ok(report)
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::collections::HashMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio::sync::Mutex;

    use crate::app_state::{PipelineContext, PipelineSettings};
    use crate::db::MemoryAssetStore;
    use crate::services::blobstore::MemoryBlobStore;
    use crate::services::inference::{
        DetectRequest, EmbedResponse, ExtractResult, FaceDetection, Inference, InferenceError,
    };
    use crate::services::notifier::MemoryNotifier;
    use crate::services::queue::MemoryTaskQueue;
    use crate::services::similarity::{Clusterer, Projection, SimilarityIndex};
    use crate::store::StagingStore;

    pub struct NoopClusterer;

    impl Clusterer for NoopClusterer {
        fn cluster(&self, embeddings: &[Vec<f32>]) -> Vec<i32> {
            vec![0; embeddings.len()]
        }
    }

    /// Scripted inference stub: canned responses or simulated outages.
    #[derive(Default)]
    pub struct StubInference {
        pub detections: Mutex<Option<Vec<FaceDetection>>>,
        pub embeddings: Mutex<Option<EmbedResponse>>,
        pub extractions: Mutex<Option<Vec<ExtractResult>>>,
        pub fail_detect: bool,
        pub fail_embed: bool,
        pub fail_extract: bool,
    }

    fn unreachable_endpoint() -> InferenceError {
        // A reqwest error without a live server: a builder error from an
        // invalid URL is the cheapest to manufacture.
        let err = reqwest::Client::new()
            .get("http://[invalid")
            .build()
            .unwrap_err();
        InferenceError::Http(err)
    }

    #[async_trait]
    impl Inference for StubInference {
        async fn detect_faces(
            &self,
            req: &DetectRequest,
        ) -> Result<Vec<FaceDetection>, InferenceError> {
            if self.fail_detect {
                return Err(unreachable_endpoint());
            }
            let canned = self.detections.lock().await;
            Ok(canned
                .clone()
                .unwrap_or_else(|| vec![FaceDetection::default(); req.idx.len()]))
        }

        async fn embed_faces(
            &self,
            batch_results: &[FaceDetection],
            _crop_root: &str,
        ) -> Result<EmbedResponse, InferenceError> {
            if self.fail_embed {
                return Err(unreachable_endpoint());
            }
            let canned = self.embeddings.lock().await;
            Ok(canned.clone().unwrap_or_else(|| {
                // Default: a unit embedding per face key.
                let mut resp = HashMap::new();
                for det in batch_results {
                    for key in &det.face_keys {
                        resp.insert(key.clone(), Some(vec![1.0, 0.0]));
                    }
                }
                resp
            }))
        }

        async fn run_ocr(
            &self,
            _req: &DetectRequest,
        ) -> Result<Vec<ExtractResult>, InferenceError> {
            if self.fail_extract {
                return Err(unreachable_endpoint());
            }
            let canned = self.extractions.lock().await;
            Ok(canned.clone().unwrap_or_default())
        }

        async fn detect_objects(
            &self,
            req: &DetectRequest,
        ) -> Result<Vec<ExtractResult>, InferenceError> {
            self.run_ocr(req).await
        }
    }

    pub struct TestHarness {
        pub ctx: PipelineContext,
        pub assets: Arc<MemoryAssetStore>,
        pub queue: Arc<MemoryTaskQueue>,
        pub notifier: Arc<MemoryNotifier>,
        pub blobs: Arc<MemoryBlobStore>,
        pub inference: Arc<StubInference>,
        _staging_dir: TempDir,
    }

    pub fn harness(inference: StubInference) -> TestHarness {
        let staging_dir = TempDir::new().unwrap();
        let staging = Arc::new(StagingStore::open(staging_dir.path()).unwrap());
        let assets = Arc::new(MemoryAssetStore::new());
        let queue = Arc::new(MemoryTaskQueue::new());
        let notifier = Arc::new(MemoryNotifier::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let inference = Arc::new(inference);
        let projection = Projection::from_matrix(vec![vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        let index = Arc::new(SimilarityIndex::new(projection, Box::new(NoopClusterer)));

        let settings = PipelineSettings {
            chunk_size: 2,
            staging_root: staging_dir.path().to_string_lossy().into_owned(),
            face_crop_root: staging_dir.path().join("faces").to_string_lossy().into_owned(),
            abort_on_partial_failure: false,
        };

        let ctx = PipelineContext::new(
            assets.clone(),
            staging,
            queue.clone(),
            notifier.clone(),
            inference.clone(),
            blobs.clone(),
            index,
            settings,
        );

        TestHarness {
            ctx,
            assets,
            queue,
            notifier,
            blobs,
            inference,
            _staging_dir: staging_dir,
        }
    }

    /// A tiny PNG, enough for the face-crop path to decode.
    pub fn tiny_png() -> Vec<u8> {
        let img = image::RgbImage::new(4, 4);
        let mut out = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }
}
