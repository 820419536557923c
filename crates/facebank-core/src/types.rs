use crate::error::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Bounding box for a detected face, in source-image pixel coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector confidence for this box (the detection probability).
    pub confidence: f32,
}

/// Integer corner-form box reported in recognition results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x_min: i32,
    pub y_min: i32,
    pub x_max: i32,
    pub y_max: i32,
}

impl From<&BoundingBox> for FaceBox {
    fn from(b: &BoundingBox) -> Self {
        // Detector boxes may spill past the top-left edge of the image.
        Self {
            x_min: (b.x as i32).max(0),
            y_min: (b.y as i32).max(0),
            x_max: (b.x + b.width) as i32,
            y_max: (b.y + b.height) as i32,
        }
    }
}

/// Face embedding vector (typically 512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Reject vectors that cannot be matched or written to the snapshot:
    /// empty ones, and any holding NaN or infinity (JSON has no encoding
    /// for those).
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.values.is_empty() {
            return Err(ValidationError::EmptyEmbedding);
        }
        match self.values.iter().position(|v| !v.is_finite()) {
            Some(index) => Err(ValidationError::NonFiniteEmbedding { index }),
            None => Ok(()),
        }
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. A zero vector
    /// on either side yields 0.0 rather than NaN.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            (dot / denom).clamp(-1.0, 1.0)
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

/// One face as reported by the external detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub gender: Option<Gender>,
}

impl DetectedFace {
    pub fn detection_score(&self) -> f32 {
        self.bbox.confidence
    }
}

/// Opaque, globally unique identifier of a stored face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FaceId(Uuid);

impl FaceId {
    pub(crate) fn mint() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for FaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for FaceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A stored face owned by exactly one subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceRecord {
    pub id: FaceId,
    pub added_at: DateTime<Utc>,
    /// File name of the image blob, relative to the blob directory.
    pub image_ref: String,
    pub embedding: Embedding,
}

/// Listing view of a face: no embedding, no blob.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceSummary {
    pub image_id: FaceId,
    pub subject: String,
    pub added_at: DateTime<Utc>,
}

/// A face record together with the name of the subject that owns it.
#[derive(Debug, Clone)]
pub struct OwnedFace {
    pub subject: String,
    pub record: FaceRecord,
}

/// Gallery entry handed to the matcher.
#[derive(Debug, Clone)]
pub struct StoredEmbedding {
    pub subject: String,
    pub id: FaceId,
    pub embedding: Embedding,
}

/// Raw image bytes of an enrolled face.
#[derive(Debug, Clone)]
pub struct FaceImage {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
}

/// Round to 5 decimal digits, the precision reported to callers.
pub fn round5(v: f32) -> f32 {
    ((v as f64 * 100_000.0).round() / 100_000.0) as f32
}
