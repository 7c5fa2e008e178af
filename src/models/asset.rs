use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Processing domain an asset is routed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Face,
    Ocr,
    ObjectDetection,
}

/// Status of an asset in the processing state machine.
///
/// Moves forward only. `Error` is reachable from any state and is terminal
/// for that attempt; a retry starts a fresh attempt rather than rolling the
/// status back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetStatus {
    Uploaded,
    Processing,
    ResultSaved,
    Completed,
    Error,
}

impl AssetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetStatus::Uploaded => "uploaded",
            AssetStatus::Processing => "processing",
            AssetStatus::ResultSaved => "result_saved",
            AssetStatus::Completed => "completed",
            AssetStatus::Error => "error",
        }
    }

    pub fn from_str_or_default(s: &str) -> Self {
        match s {
            "processing" => AssetStatus::Processing,
            "result_saved" => AssetStatus::ResultSaved,
            "completed" => AssetStatus::Completed,
            "error" => AssetStatus::Error,
            _ => AssetStatus::Uploaded,
        }
    }

    /// Whether moving from `self` to `next` respects the forward-only rule.
    pub fn can_transition(&self, next: AssetStatus) -> bool {
        next == AssetStatus::Error || *self < next
    }
}

/// One detection, in detection order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub coords: [f32; 4],
    pub confidence: f32,
    pub class_name: String,
}

/// Domain-specific result payload carried on the asset record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "values", rename_all = "snake_case")]
pub enum DomainPayload {
    Faces(Vec<String>),
    Texts(Vec<String>),
    ObjectsDet(Vec<String>),
}

impl DomainPayload {
    pub fn empty_for(domain: Domain) -> Self {
        match domain {
            Domain::Face => DomainPayload::Faces(Vec::new()),
            Domain::Ocr => DomainPayload::Texts(Vec::new()),
            Domain::ObjectDetection => DomainPayload::ObjectsDet(Vec::new()),
        }
    }

    pub fn domain(&self) -> Domain {
        match self {
            DomainPayload::Faces(_) => Domain::Face,
            DomainPayload::Texts(_) => Domain::Ocr,
            DomainPayload::ObjectsDet(_) => Domain::ObjectDetection,
        }
    }

    pub fn values(&self) -> &[String] {
        match self {
            DomainPayload::Faces(v) | DomainPayload::Texts(v) | DomainPayload::ObjectsDet(v) => v,
        }
    }
}

/// A user-submitted image tracked through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub id: String,
    pub domain: Domain,
    pub status: AssetStatus,
    pub created_at: DateTime<Utc>,
    pub bounding_boxes: Vec<BoundingBox>,
    /// Handle into the blob store collaborator.
    pub blob_ref: Option<String>,
    pub is_new: bool,
    pub payload: DomainPayload,
}

impl Asset {
    pub fn new(id: impl Into<String>, domain: Domain) -> Self {
        Self {
            id: id.into(),
            domain,
            status: AssetStatus::Uploaded,
            created_at: Utc::now(),
            bounding_boxes: Vec::new(),
            blob_ref: None,
            is_new: true,
            payload: DomainPayload::empty_for(domain),
        }
    }
}

/// One detected face's embedding. Many-to-one with an asset via the
/// asset's `faces` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceEmbedding {
    pub face_id: String,
    pub embedding: Vec<f32>,
    /// Handle to the cropped face blob, when one was stored.
    pub blob_ref: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_moves_forward_only() {
        assert!(AssetStatus::Uploaded.can_transition(AssetStatus::Processing));
        assert!(AssetStatus::Uploaded.can_transition(AssetStatus::ResultSaved));
        assert!(AssetStatus::Processing.can_transition(AssetStatus::ResultSaved));
        assert!(!AssetStatus::ResultSaved.can_transition(AssetStatus::Processing));
        assert!(!AssetStatus::Completed.can_transition(AssetStatus::Uploaded));
    }

    #[test]
    fn test_error_reachable_from_any_state() {
        for status in [
            AssetStatus::Uploaded,
            AssetStatus::Processing,
            AssetStatus::ResultSaved,
            AssetStatus::Completed,
        ] {
            assert!(status.can_transition(AssetStatus::Error));
        }
    }

    #[test]
    fn test_payload_matches_domain() {
        let asset = Asset::new("img_001.jpg", Domain::Ocr);
        assert_eq!(asset.payload.domain(), Domain::Ocr);
        assert!(asset.payload.values().is_empty());
    }
}
