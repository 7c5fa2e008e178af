use std::sync::Arc;

use crate::db::AssetStore;
use crate::services::blobstore::BlobStore;
use crate::services::inference::Inference;
use crate::services::notifier::ResultNotifier;
use crate::services::queue::TaskQueue;
use crate::services::similarity::SimilarityIndex;
use crate::store::ledger::{FailureLedger, ResultLedger};
use crate::store::StagingStore;

/// Behavioral knobs threaded in from configuration.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Fixed chunk size for batch splitting.
    pub chunk_size: usize,
    /// Staging root advertised to the detect/OCR/object endpoints.
    pub staging_root: String,
    /// Face-crop root advertised to the embed endpoint.
    pub face_crop_root: String,
    /// When true, any per-id failure fails the whole batch instead of
    /// being carried in the report's error list.
    pub abort_on_partial_failure: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            chunk_size: 10,
            staging_root: String::new(),
            face_crop_root: String::new(),
            abort_on_partial_failure: false,
        }
    }
}

/// Shared pipeline context passed to every component.
///
/// Constructed once at process start; components never reach for ambient
/// globals.
#[derive(Clone)]
pub struct PipelineContext {
    pub assets: Arc<dyn AssetStore>,
    pub staging: Arc<StagingStore>,
    pub failures: FailureLedger,
    pub results: ResultLedger,
    pub queue: Arc<dyn TaskQueue>,
    pub notifier: Arc<dyn ResultNotifier>,
    pub inference: Arc<dyn Inference>,
    pub blobs: Arc<dyn BlobStore>,
    pub index: Arc<SimilarityIndex>,
    pub settings: PipelineSettings,
}

impl PipelineContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        assets: Arc<dyn AssetStore>,
        staging: Arc<StagingStore>,
        queue: Arc<dyn TaskQueue>,
        notifier: Arc<dyn ResultNotifier>,
        inference: Arc<dyn Inference>,
        blobs: Arc<dyn BlobStore>,
        index: Arc<SimilarityIndex>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            assets,
            failures: FailureLedger::new(staging.clone()),
            results: ResultLedger::new(staging.clone()),
            staging,
            queue,
            notifier,
            inference,
            blobs,
            index,
            settings,
        }
    }
}
