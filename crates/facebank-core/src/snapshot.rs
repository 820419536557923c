//! Durable snapshot of the embedding store.
//!
//! File format: a JSON envelope
//!
//! ```text
//! {
//!   "format_version": 1,
//!   "saved_at": "<RFC 3339>",
//!   "checksum": "<hex SHA-256 of the serialized `subjects` array>",
//!   "subjects": [ { "name": ..., "faces": [ { "id", "added_at", "image_ref", "embedding" } ] } ]
//! }
//! ```
//!
//! Subjects and faces are written in insertion order. Image bytes are not
//! part of the snapshot; they live in the blob directory keyed by face id.
//!
//! Saves are atomic: temp file -> fsync -> rename.

use crate::store::{StoreState, SubjectEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Current file format version
const FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed snapshot: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid snapshot contents: {0}")]
    Invalid(String),

    #[error("version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u32, u32),

    #[error("checksum mismatch: file may be corrupted")]
    ChecksumMismatch,
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    format_version: u32,
    saved_at: DateTime<Utc>,
    checksum: String,
    subjects: &'a [SubjectEntry],
}

#[derive(Deserialize)]
struct Envelope {
    format_version: u32,
    #[allow(dead_code)]
    saved_at: DateTime<Utc>,
    checksum: String,
    subjects: Vec<SubjectEntry>,
}

/// What [`SnapshotFile::load_or_recover`] found on disk.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    /// No snapshot existed; starting empty.
    Fresh,
    Loaded { subjects: usize, faces: usize },
    /// The snapshot was unreadable. It was moved aside and the store starts
    /// empty: every previously enrolled face is gone until an operator
    /// restores the quarantined file.
    Recovered { quarantined: PathBuf, reason: String },
}

/// The snapshot file on disk.
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a full snapshot of `state`, replacing the previous one atomically.
    pub fn save(&self, state: &StoreState) -> Result<(), SnapshotError> {
        let temp_path = self.path.with_extension("tmp");

        let result = self.write_to_file(&temp_path, state);
        if result.is_err() {
            let _ = fs::remove_file(&temp_path);
            return result;
        }

        fs::rename(&temp_path, &self.path)?;
        self.sync_parent_dir();
        Ok(())
    }

    fn write_to_file(&self, path: &Path, state: &StoreState) -> Result<(), SnapshotError> {
        let subjects = state.subjects();
        let envelope = EnvelopeRef {
            format_version: FORMAT_VERSION,
            saved_at: Utc::now(),
            checksum: checksum(subjects)?,
            subjects,
        };

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &envelope)?;
        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    }

    #[cfg(unix)]
    fn sync_parent_dir(&self) {
        let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) else {
            return;
        };
        if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
            tracing::debug!(dir = %parent.display(), error = %e, "directory fsync failed");
        }
    }

    #[cfg(not(unix))]
    fn sync_parent_dir(&self) {}

    /// Read the snapshot. `Ok(None)` when no file exists.
    pub fn load(&self) -> Result<Option<StoreState>, SnapshotError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let envelope: Envelope = serde_json::from_slice(&bytes)?;
        if envelope.format_version > FORMAT_VERSION {
            return Err(SnapshotError::VersionMismatch(
                envelope.format_version,
                FORMAT_VERSION,
            ));
        }
        if checksum(&envelope.subjects)? != envelope.checksum {
            return Err(SnapshotError::ChecksumMismatch);
        }
        validate(&envelope.subjects)?;

        Ok(Some(StoreState::from_subjects(envelope.subjects)))
    }

    /// Load the snapshot, falling back to an empty store when there is none
    /// or when it cannot be read. An unreadable file is renamed aside rather
    /// than overwritten by the next save.
    pub fn load_or_recover(&self) -> (StoreState, LoadOutcome) {
        match self.load() {
            Ok(None) => {
                tracing::info!(path = %self.path.display(), "no snapshot found; starting with an empty store");
                (StoreState::default(), LoadOutcome::Fresh)
            }
            Ok(Some(state)) => {
                let subjects = state.subjects().len();
                let faces = state.face_count();
                tracing::info!(path = %self.path.display(), subjects, faces, "snapshot loaded");
                (state, LoadOutcome::Loaded { subjects, faces })
            }
            Err(e) => {
                let reason = e.to_string();
                let quarantined = self.quarantine_path();
                match fs::rename(&self.path, &quarantined) {
                    Ok(()) => tracing::error!(
                        path = %self.path.display(),
                        quarantined = %quarantined.display(),
                        error = %reason,
                        "snapshot unreadable; moved aside and starting with an EMPTY store. \
                         Enrolled faces are not available until the file is restored"
                    ),
                    Err(rename_err) => tracing::error!(
                        path = %self.path.display(),
                        error = %reason,
                        rename_error = %rename_err,
                        "snapshot unreadable and could not be moved aside; starting with an EMPTY store. \
                         The next mutation will overwrite it"
                    ),
                }
                (
                    StoreState::default(),
                    LoadOutcome::Recovered {
                        quarantined,
                        reason,
                    },
                )
            }
        }
    }

    fn quarantine_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "snapshot".to_string());
        self.path
            .with_file_name(format!("{name}.corrupt-{}", Utc::now().timestamp()))
    }
}

fn checksum(subjects: &[SubjectEntry]) -> Result<String, SnapshotError> {
    let bytes = serde_json::to_vec(subjects)?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// Reject snapshots that would break store invariants once loaded.
fn validate(subjects: &[SubjectEntry]) -> Result<(), SnapshotError> {
    let mut names = HashSet::new();
    let mut ids = HashSet::new();
    let mut dimension = None;

    for subject in subjects {
        if !names.insert(subject.name.as_str()) {
            return Err(SnapshotError::Invalid(format!(
                "duplicate subject '{}'",
                subject.name
            )));
        }
        for face in &subject.faces {
            if !ids.insert(face.id) {
                return Err(SnapshotError::Invalid(format!("duplicate face id {}", face.id)));
            }
            let dim = face.embedding.dimension();
            match dimension {
                None => dimension = Some(dim),
                Some(expected) if expected != dim => {
                    return Err(SnapshotError::Invalid(format!(
                        "face {} has {dim}-dimensional embedding, expected {expected}",
                        face.id
                    )));
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}
