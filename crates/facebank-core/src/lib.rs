//! facebank-core — subject/face embedding store and 1:N face matching.
//!
//! Keeps subjects and their enrolled face embeddings, persists them as an
//! atomic JSON snapshot with image blobs alongside, and ranks probe
//! embeddings against the gallery by cosine similarity. Face detection is
//! supplied by the caller through [`FaceDetector`].

pub mod blobs;
pub mod detector;
pub mod engine;
pub mod error;
pub mod matcher;
pub mod snapshot;
pub mod store;
pub mod types;

pub use detector::{DetectorError, FaceDetector};
pub use engine::{
    EngineConfig, EnrollOptions, Enrolled, RecognitionEngine, RecognizeOptions, RecognizedFace,
};
pub use error::{ErrorKind, FacebankError, ValidationError};
pub use matcher::{CosineMatcher, Matcher, SubjectMatch};
pub use snapshot::LoadOutcome;
pub use store::{EmbeddingStore, StoreStats};
pub use types::{BoundingBox, DetectedFace, Embedding, FaceId, FaceSummary, Gender};
