use crate::blobs::BlobError;
use crate::detector::DetectorError;
use crate::snapshot::SnapshotError;
use crate::types::FaceId;
use thiserror::Error;

/// Coarse classification of a [`FacebankError`], for callers that map
/// outcomes onto a transport (e.g. HTTP 404 / 400 / 500).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    Validation,
    Internal,
}

/// Rejections of caller input. Expected and recoverable.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("image could not be decoded")]
    InvalidImage,
    #[error("no face is found in the given image")]
    NoFaceFound,
    #[error("more than one face found in the image ({0})")]
    MultipleFacesFound(usize),
    #[error("face detection probability ({score:.2}) below threshold ({threshold})")]
    BelowDetectionThreshold { score: f32, threshold: f32 },
    #[error("subject name must not be empty")]
    EmptySubjectName,
    #[error("embedding has {got} dimensions, store holds {expected}-dimensional embeddings")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("embedding is empty")]
    EmptyEmbedding,
    #[error("embedding value at index {index} is not finite")]
    NonFiniteEmbedding { index: usize },
}

#[derive(Error, Debug)]
pub enum FacebankError {
    #[error("subject '{0}' not found")]
    SubjectNotFound(String),
    #[error("face '{0}' not found")]
    FaceNotFound(FaceId),
    #[error("image file for face '{0}' not found on disk")]
    ImageNotFound(FaceId),
    #[error("subject '{0}' already exists")]
    SubjectExists(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("persistence failed: {0}")]
    Persistence(#[from] SnapshotError),
    #[error("blob storage failed: {0}")]
    Blob(#[from] BlobError),
    #[error("detector failed: {0}")]
    Detector(#[from] DetectorError),
    #[error("store lock poisoned")]
    Poisoned,
}

impl FacebankError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SubjectNotFound(_) | Self::FaceNotFound(_) | Self::ImageNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::SubjectExists(_) => ErrorKind::AlreadyExists,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Persistence(_) | Self::Blob(_) | Self::Detector(_) | Self::Poisoned => {
                ErrorKind::Internal
            }
        }
    }
}

pub type Result<T, E = FacebankError> = std::result::Result<T, E>;
