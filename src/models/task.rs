use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::asset::Domain;

/// Logical queue names. These are part of the wire contract with deployed
/// workers and must not be renamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    ImageUpload,
    ImageProcessing,
    WriteCacheAndProcess,
}

impl QueueName {
    /// Dequeue order used by the worker poll loop.
    pub const ALL: [QueueName; 3] = [
        QueueName::ImageUpload,
        QueueName::WriteCacheAndProcess,
        QueueName::ImageProcessing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::ImageUpload => "image_upload",
            QueueName::ImageProcessing => "image_processing",
            QueueName::WriteCacheAndProcess => "write_cache_and_process",
        }
    }
}

/// One asset's raw bytes travelling through the cache-write queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedEntry {
    pub asset_id: String,
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(de)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

/// Task payload serialized onto a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum QueuedTask {
    /// Ingestion: create asset records, fetch bytes from the blob store,
    /// and submit them for staging.
    IngestBatch {
        task_id: Uuid,
        asset_ids: Vec<String>,
        domain: Domain,
    },
    /// Stage one chunk's bytes in a single transaction, then chain into
    /// the domain's processing queue.
    WriteCacheAndProcess {
        task_id: Uuid,
        domain: Domain,
        entries: Vec<StagedEntry>,
    },
    /// Run the domain stage over one staged chunk.
    ProcessBatch {
        task_id: Uuid,
        asset_ids: Vec<String>,
        domain: Domain,
    },
}

impl QueuedTask {
    /// The queue this task is dispatched on. Routing is purely by task
    /// kind and domain tag, never by content.
    pub fn queue(&self) -> QueueName {
        match self {
            QueuedTask::IngestBatch { .. } => QueueName::ImageUpload,
            QueuedTask::WriteCacheAndProcess { .. } => QueueName::WriteCacheAndProcess,
            QueuedTask::ProcessBatch { .. } => QueueName::ImageProcessing,
        }
    }

    pub fn task_id(&self) -> Uuid {
        match self {
            QueuedTask::IngestBatch { task_id, .. }
            | QueuedTask::WriteCacheAndProcess { task_id, .. }
            | QueuedTask::ProcessBatch { task_id, .. } => *task_id,
        }
    }
}

/// Classification of a failed pipeline unit, driving retry routing.
///
/// The serialized tags keep the historical `<domain>_<stage>Failed` string
/// convention so ledger entries written by older workers still route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    #[serde(rename = "uploadFailed")]
    Upload,
    #[serde(rename = "face_detectFailed")]
    FaceDetect,
    #[serde(rename = "face_embedFailed")]
    FaceEmbed,
    #[serde(rename = "face_persistFailed")]
    FacePersist,
    #[serde(rename = "ocr_extractFailed")]
    OcrExtract,
    #[serde(rename = "object_detectFailed")]
    ObjectDetect,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Upload => "uploadFailed",
            FailureKind::FaceDetect => "face_detectFailed",
            FailureKind::FaceEmbed => "face_embedFailed",
            FailureKind::FacePersist => "face_persistFailed",
            FailureKind::OcrExtract => "ocr_extractFailed",
            FailureKind::ObjectDetect => "object_detectFailed",
        }
    }

    /// `upload…` classifications resubmit the ingestion stage; everything
    /// else resubmits the matching processing stage.
    pub fn routes_to_ingestion(&self) -> bool {
        self.as_str().starts_with("upload")
    }
}

/// Durable record of a failed pipeline unit awaiting resubmission.
///
/// Carries enough context (`kind` + `asset_ids` + `domain`) to resubmit the
/// exact failed unit of work without re-deriving anything from the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedTaskRecord {
    pub task_id: Uuid,
    pub kind: FailureKind,
    pub asset_ids: Vec<String>,
    pub domain: Domain,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl FailedTaskRecord {
    pub fn new(
        task_id: Uuid,
        kind: FailureKind,
        asset_ids: Vec<String>,
        domain: Domain,
        error: impl Into<String>,
    ) -> Self {
        Self {
            task_id,
            kind,
            asset_ids,
            domain,
            error: error.into(),
            failed_at: Utc::now(),
        }
    }
}

/// Batch-level outcome of one stage run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Success,
    Failure,
}

/// Structured result of processing one chunk: success may still carry
/// per-id errors, failure never silently drops work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub status: BatchStatus,
    pub errors: Vec<String>,
}

impl BatchReport {
    pub fn success(errors: Vec<String>) -> Self {
        Self {
            status: BatchStatus::Success,
            errors,
        }
    }

    pub fn failure(error: impl Into<String>, mut errors: Vec<String>) -> Self {
        errors.push(error.into());
        Self {
            status: BatchStatus::Failure,
            errors,
        }
    }
}

/// Handle to one chunk's chained task, returned to the submitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkHandle {
    pub task_id: Uuid,
    pub asset_ids: Vec<String>,
}

/// Outcome of `submit_batch`: per-chunk handles plus per-id read errors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitReport {
    pub chunks: Vec<ChunkHandle>,
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_routing_by_task_kind() {
        let task = QueuedTask::ProcessBatch {
            task_id: Uuid::new_v4(),
            asset_ids: vec!["a".into()],
            domain: Domain::Ocr,
        };
        assert_eq!(task.queue(), QueueName::ImageProcessing);
        assert_eq!(task.queue().as_str(), "image_processing");
    }

    #[test]
    fn test_failure_kind_tags_are_stable() {
        assert_eq!(FailureKind::FaceDetect.as_str(), "face_detectFailed");
        assert_eq!(
            serde_json::to_value(FailureKind::OcrExtract).unwrap(),
            serde_json::json!("ocr_extractFailed")
        );
    }

    #[test]
    fn test_upload_prefix_routes_to_ingestion() {
        assert!(FailureKind::Upload.routes_to_ingestion());
        assert!(!FailureKind::FaceEmbed.routes_to_ingestion());
    }

    #[test]
    fn test_staged_entry_bytes_round_trip() {
        let entry = StagedEntry {
            asset_id: "img_1.jpg".into(),
            bytes: vec![0xde, 0xad, 0xbe, 0xef],
        };
        let json = serde_json::to_string(&entry).unwrap();
        let back: StagedEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back.bytes, entry.bytes);
    }
}
