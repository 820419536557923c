//! Detector backed by precomputed detections.
//!
//! The CLI does not run a detection model. It reads the output of one
//! (a JSON array of detected faces with bounding box, embedding and
//! optional age/gender) and hands it to the engine as a [`FaceDetector`].

use anyhow::{Context, Result};
use facebank_core::{DetectedFace, DetectorError, FaceDetector};
use std::path::Path;

pub struct DetectionsFile {
    faces: Vec<DetectedFace>,
}

impl DetectionsFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading detections {}", path.display()))?;
        let faces: Vec<DetectedFace> = serde_json::from_str(&text)
            .with_context(|| format!("parsing detections {}", path.display()))?;
        tracing::debug!(path = %path.display(), faces = faces.len(), "detections loaded");
        Ok(Self { faces })
    }
}

impl FaceDetector for DetectionsFile {
    fn detect(&self, _image: &[u8]) -> Result<Vec<DetectedFace>, DetectorError> {
        Ok(self.faces.clone())
    }
}
