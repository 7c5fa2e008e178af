use std::time::Duration;

use serde::Deserialize;

use crate::app_state::PipelineSettings;
use crate::services::inference::InferenceEndpoints;

#[derive(Debug, Deserialize)]
pub struct PipelineConfig {
    /// PostgreSQL connection string for asset records
    pub database_url: String,

    /// Redis connection string for task queues and pub/sub
    pub redis_url: String,

    /// Directory of the staging store (RocksDB)
    pub staging_path: String,

    /// Face-crop root advertised to the embed endpoint. Defaults to
    /// `<staging_path>/faces`.
    #[serde(default)]
    pub face_crop_path: Option<String>,

    /// JSON weights file for the similarity projection
    pub projection_weights_path: String,

    /// Blob store bucket name (S3-compatible)
    pub blob_bucket: String,

    /// Blob store endpoint URL
    pub blob_endpoint: String,

    /// Blob store access key ID
    pub blob_access_key: String,

    /// Blob store secret access key
    pub blob_secret_key: String,

    /// Face-detect endpoint URL
    pub face_detect_url: String,

    /// Face-embed endpoint URL
    pub face_embed_url: String,

    /// OCR endpoint URL
    pub ocr_url: String,

    /// Object-detection endpoint URL
    pub object_detect_url: String,

    /// Per-request timeout for all inference calls, in seconds
    #[serde(default = "default_inference_timeout_secs")]
    pub inference_timeout_secs: u64,

    /// Fixed chunk size for batch splitting
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Worker queue poll interval when idle, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Retry-supervisor sweep interval, in seconds
    #[serde(default = "default_retry_sweep_interval_secs")]
    pub retry_sweep_interval_secs: u64,

    /// Maintenance sweep interval, in seconds
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,

    /// Age after which an asset stops counting as new, in seconds
    #[serde(default = "default_is_new_ttl_secs")]
    pub is_new_ttl_secs: u64,

    /// Fail a whole batch on any per-id error instead of reporting a
    /// success with an error list
    #[serde(default)]
    pub abort_on_partial_failure: bool,

    /// Bind address for the Prometheus exporter (e.g. "0.0.0.0:9095").
    /// Disabled when unset.
    #[serde(default)]
    pub metrics_addr: Option<String>,
}

fn default_inference_timeout_secs() -> u64 {
    30
}

fn default_chunk_size() -> usize {
    10
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_retry_sweep_interval_secs() -> u64 {
    60
}

fn default_maintenance_interval_secs() -> u64 {
    3600
}

fn default_is_new_ttl_secs() -> u64 {
    3600
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn face_crop_root(&self) -> String {
        self.face_crop_path
            .clone()
            .unwrap_or_else(|| format!("{}/faces", self.staging_path))
    }

    pub fn inference_endpoints(&self) -> InferenceEndpoints {
        InferenceEndpoints {
            face_detect_url: self.face_detect_url.clone(),
            face_embed_url: self.face_embed_url.clone(),
            ocr_url: self.ocr_url.clone(),
            object_detect_url: self.object_detect_url.clone(),
            timeout: Duration::from_secs(self.inference_timeout_secs),
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            chunk_size: self.chunk_size,
            staging_root: self.staging_path.clone(),
            face_crop_root: self.face_crop_root(),
            abort_on_partial_failure: self.abort_on_partial_failure,
        }
    }
}
