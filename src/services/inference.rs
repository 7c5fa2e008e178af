use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Request body shared by the detect, OCR, and object-detection endpoints:
/// `{"idx": [assetId, ...], "lmdb_path": stagingRoot}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectRequest {
    pub idx: Vec<String>,
    pub lmdb_path: String,
}

/// Per-image result from the face-detect endpoint, in request order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FaceDetection {
    #[serde(default)]
    pub boxes: Vec<[f32; 4]>,
    #[serde(default)]
    pub confidences: Vec<f32>,
    #[serde(default)]
    pub landmarks: Option<serde_json::Value>,
    /// Keys of the cropped faces staged for the embed endpoint, one per box.
    #[serde(default)]
    pub face_keys: Vec<String>,
}

impl FaceDetection {
    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    batch_results: Vec<FaceDetection>,
}

/// Embed request: the detect output plus the face-crop staging root.
#[derive(Debug, Serialize)]
pub struct EmbedRequest<'a> {
    pub batch_results: &'a [FaceDetection],
    pub lmdb_path: &'a str,
}

/// Face key → embedding vector, or null when embedding failed for that face.
pub type EmbedResponse = HashMap<String, Option<Vec<f32>>>;

/// Per-image result from the combined OCR / object-detection endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractResult {
    pub idx: String,
    #[serde(default)]
    pub boxes: Vec<[f32; 4]>,
    #[serde(default)]
    pub confidences: Vec<f32>,
    #[serde(default)]
    pub texts: Option<Vec<String>>,
    #[serde(default)]
    pub objects: Option<Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("inference request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// The external ML serving layer: face detect/embed, OCR, object detection.
///
/// Every call carries a finite timeout; none may block indefinitely.
#[async_trait]
pub trait Inference: Send + Sync {
    async fn detect_faces(&self, req: &DetectRequest) -> Result<Vec<FaceDetection>, InferenceError>;

    async fn embed_faces(
        &self,
        batch_results: &[FaceDetection],
        crop_root: &str,
    ) -> Result<EmbedResponse, InferenceError>;

    async fn run_ocr(&self, req: &DetectRequest) -> Result<Vec<ExtractResult>, InferenceError>;

    async fn detect_objects(&self, req: &DetectRequest)
        -> Result<Vec<ExtractResult>, InferenceError>;
}

/// Endpoint URLs and the shared request timeout.
#[derive(Debug, Clone)]
pub struct InferenceEndpoints {
    pub face_detect_url: String,
    pub face_embed_url: String,
    pub ocr_url: String,
    pub object_detect_url: String,
    pub timeout: Duration,
}

/// HTTP client for the inference endpoints (JSON over POST).
pub struct HttpInferenceClient {
    http: Client,
    endpoints: InferenceEndpoints,
}

impl HttpInferenceClient {
    pub fn new(endpoints: InferenceEndpoints) -> Result<Self, InferenceError> {
        let http = Client::builder().timeout(endpoints.timeout).build()?;
        Ok(Self { http, endpoints })
    }

    async fn post_json<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        endpoint: &'static str,
        body: &B,
    ) -> Result<R, InferenceError> {
        let start = std::time::Instant::now();
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        let parsed = response.json().await?;
        metrics::histogram!("inference_request_seconds", "endpoint" => endpoint)
            .record(start.elapsed().as_secs_f64());
        Ok(parsed)
    }
}

#[async_trait]
impl Inference for HttpInferenceClient {
    async fn detect_faces(&self, req: &DetectRequest) -> Result<Vec<FaceDetection>, InferenceError> {
        let resp: DetectResponse = self
            .post_json(&self.endpoints.face_detect_url, "face_detect", req)
            .await?;
        Ok(resp.batch_results)
    }

    async fn embed_faces(
        &self,
        batch_results: &[FaceDetection],
        crop_root: &str,
    ) -> Result<EmbedResponse, InferenceError> {
        let req = EmbedRequest {
            batch_results,
            lmdb_path: crop_root,
        };
        self.post_json(&self.endpoints.face_embed_url, "face_embed", &req)
            .await
    }

    async fn run_ocr(&self, req: &DetectRequest) -> Result<Vec<ExtractResult>, InferenceError> {
        self.post_json(&self.endpoints.ocr_url, "ocr", req).await
    }

    async fn detect_objects(
        &self,
        req: &DetectRequest,
    ) -> Result<Vec<ExtractResult>, InferenceError> {
        self.post_json(&self.endpoints.object_detect_url, "object_detect", req)
            .await
    }
}
