//! Face detection capability.
//!
//! Detection and embedding extraction are supplied from outside this crate
//! (an ONNX pipeline, a sidecar process, precomputed results). The engine
//! only depends on this trait and never holds a store lock while calling it.

use crate::types::DetectedFace;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("image could not be decoded: {0}")]
    Undecodable(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
}

/// Turns encoded image bytes into zero or more detected faces.
///
/// Implementations must be shareable across request handlers; a detector
/// that needs `&mut` access to its model should serialize internally.
pub trait FaceDetector: Send + Sync {
    fn detect(&self, image: &[u8]) -> Result<Vec<DetectedFace>, DetectorError>;
}

impl<D: FaceDetector + ?Sized> FaceDetector for Box<D> {
    fn detect(&self, image: &[u8]) -> Result<Vec<DetectedFace>, DetectorError> {
        (**self).detect(image)
    }
}
