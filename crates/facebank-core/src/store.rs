//! Subject/face embedding store.
//!
//! All state sits behind one `RwLock`. Reads share it; every mutation takes
//! the write lock, applies the change to a staged copy, writes that copy as
//! the durable snapshot, and only then swaps it in. A failed snapshot write
//! therefore leaves the in-memory store exactly as it was.

use crate::blobs::{self, BlobStore};
use crate::error::{FacebankError, Result, ValidationError};
use crate::snapshot::{LoadOutcome, SnapshotFile};
use crate::types::{Embedding, FaceId, FaceImage, FaceRecord, FaceSummary, OwnedFace, StoredEmbedding};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

const SNAPSHOT_FILE: &str = "embeddings.json";
const IMAGES_DIR: &str = "images";

/// A subject and the faces it owns, in insertion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectEntry {
    pub name: String,
    pub faces: Vec<FaceRecord>,
}

/// In-memory store contents. Subjects keep insertion order; `owners`
/// indexes every live face id to its subject.
#[derive(Debug, Clone, Default)]
pub struct StoreState {
    subjects: Vec<SubjectEntry>,
    owners: HashMap<FaceId, String>,
}

impl StoreState {
    pub(crate) fn from_subjects(subjects: Vec<SubjectEntry>) -> Self {
        let owners = subjects
            .iter()
            .flat_map(|s| s.faces.iter().map(move |f| (f.id, s.name.clone())))
            .collect();
        Self { subjects, owners }
    }

    pub fn subjects(&self) -> &[SubjectEntry] {
        &self.subjects
    }

    pub fn face_count(&self) -> usize {
        self.owners.len()
    }

    /// Dimension shared by every stored embedding, if any face exists.
    pub fn dimension(&self) -> Option<usize> {
        self.subjects
            .iter()
            .flat_map(|s| s.faces.first())
            .map(|f| f.embedding.dimension())
            .next()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.subjects.iter().position(|s| s.name == name)
    }

    fn subject(&self, name: &str) -> Option<&SubjectEntry> {
        self.subjects.iter().find(|s| s.name == name)
    }

    fn add_subject(&mut self, name: &str) -> Result<()> {
        if self.position(name).is_some() {
            return Err(FacebankError::SubjectExists(name.to_string()));
        }
        self.subjects.push(SubjectEntry {
            name: name.to_string(),
            faces: Vec::new(),
        });
        Ok(())
    }

    fn remove_subject(&mut self, name: &str) -> Result<SubjectEntry> {
        let idx = self
            .position(name)
            .ok_or_else(|| FacebankError::SubjectNotFound(name.to_string()))?;
        let entry = self.subjects.remove(idx);
        for face in &entry.faces {
            self.owners.remove(&face.id);
        }
        Ok(entry)
    }

    fn rename_subject(&mut self, old: &str, new: &str) -> Result<()> {
        let idx = self
            .position(old)
            .ok_or_else(|| FacebankError::SubjectNotFound(old.to_string()))?;
        if self.position(new).is_some() {
            return Err(FacebankError::SubjectExists(new.to_string()));
        }
        let entry = &mut self.subjects[idx];
        entry.name = new.to_string();
        for face in &entry.faces {
            self.owners.insert(face.id, new.to_string());
        }
        Ok(())
    }

    fn mint_id(&self) -> FaceId {
        loop {
            let id = FaceId::mint();
            if !self.owners.contains_key(&id) {
                return id;
            }
        }
    }

    fn insert_face(&mut self, subject: &str, record: FaceRecord) {
        let idx = match self.position(subject) {
            Some(idx) => idx,
            None => {
                tracing::debug!(subject, "creating subject on first face");
                self.subjects.push(SubjectEntry {
                    name: subject.to_string(),
                    faces: Vec::new(),
                });
                self.subjects.len() - 1
            }
        };
        self.owners.insert(record.id, subject.to_string());
        self.subjects[idx].faces.push(record);
    }

    fn remove_face(&mut self, id: FaceId) -> Result<(String, FaceRecord)> {
        let subject = self
            .owners
            .remove(&id)
            .ok_or(FacebankError::FaceNotFound(id))?;
        let entry = self
            .subjects
            .iter_mut()
            .find(|s| s.name == subject)
            .ok_or(FacebankError::FaceNotFound(id))?;
        let pos = entry
            .faces
            .iter()
            .position(|f| f.id == id)
            .ok_or(FacebankError::FaceNotFound(id))?;
        Ok((subject, entry.faces.remove(pos)))
    }

    fn clear_faces(&mut self, subject: &str) -> Result<Vec<FaceRecord>> {
        let idx = self
            .position(subject)
            .ok_or_else(|| FacebankError::SubjectNotFound(subject.to_string()))?;
        let faces = std::mem::take(&mut self.subjects[idx].faces);
        for face in &faces {
            self.owners.remove(&face.id);
        }
        Ok(faces)
    }

    fn find_face(&self, id: FaceId) -> Option<OwnedFace> {
        let subject = self.owners.get(&id)?;
        let record = self.subject(subject)?.faces.iter().find(|f| f.id == id)?;
        Some(OwnedFace {
            subject: subject.clone(),
            record: record.clone(),
        })
    }
}

/// Store counters, for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStats {
    pub subjects: usize,
    pub faces: usize,
    pub dimension: Option<usize>,
}

fn validate_name(name: &str) -> Result<&str> {
    if name.trim().is_empty() {
        return Err(ValidationError::EmptySubjectName.into());
    }
    Ok(name)
}

/// The authoritative subject → face map, with durable snapshots and image blobs.
///
/// Construct once at startup and share by reference (`Arc<EmbeddingStore>`).
pub struct EmbeddingStore {
    state: RwLock<StoreState>,
    snapshot: SnapshotFile,
    blobs: BlobStore,
}

impl EmbeddingStore {
    /// Open the store rooted at `data_dir`: `embeddings.json` plus `images/`.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<(Self, LoadOutcome)> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir).map_err(|e| FacebankError::Persistence(e.into()))?;
        Self::with_paths(data_dir.join(SNAPSHOT_FILE), data_dir.join(IMAGES_DIR))
    }

    pub fn with_paths(
        snapshot_path: impl Into<PathBuf>,
        blob_dir: impl Into<PathBuf>,
    ) -> Result<(Self, LoadOutcome)> {
        let snapshot = SnapshotFile::new(snapshot_path);
        let blobs = BlobStore::open(blob_dir)?;
        let (state, outcome) = snapshot.load_or_recover();

        // After a recovery the quarantined snapshot may still reference these
        // blobs, so they are only swept when the snapshot was read cleanly.
        if !matches!(outcome, LoadOutcome::Recovered { .. }) {
            let live: HashSet<&str> = state
                .subjects()
                .iter()
                .flat_map(|s| s.faces.iter().map(|f| f.image_ref.as_str()))
                .collect();
            match blobs.sweep_orphans(&live) {
                Ok(0) => {}
                Ok(removed) => tracing::info!(removed, "swept orphaned image blobs"),
                Err(e) => tracing::warn!(error = %e, "orphaned blob sweep failed"),
            }
        }

        let store = Self {
            state: RwLock::new(state),
            snapshot,
            blobs,
        };
        Ok((store, outcome))
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, StoreState>> {
        self.state.read().map_err(|_| FacebankError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, StoreState>> {
        self.state.write().map_err(|_| FacebankError::Poisoned)
    }

    /// Apply `f` to a staged copy, persist it, then publish it.
    fn mutate<T>(
        &self,
        op: &'static str,
        target: &str,
        f: impl FnOnce(&mut StoreState) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self.write()?;
        let mut staged = guard.clone();
        let out = f(&mut staged)?;
        if let Err(e) = self.snapshot.save(&staged) {
            tracing::error!(op, target, error = %e, "snapshot write failed; change rolled back");
            return Err(e.into());
        }
        *guard = staged;
        Ok(out)
    }

    /// Subject names in creation order.
    pub fn list_subjects(&self) -> Result<Vec<String>> {
        Ok(self.read()?.subjects.iter().map(|s| s.name.clone()).collect())
    }

    pub fn subject_exists(&self, name: &str) -> Result<bool> {
        Ok(self.read()?.position(name).is_some())
    }

    pub fn add_subject(&self, name: &str) -> Result<()> {
        let name = validate_name(name)?;
        self.mutate("add_subject", name, |state| state.add_subject(name))?;
        tracing::info!(subject = name, "subject created");
        Ok(())
    }

    /// Delete a subject, all of its faces, and their image blobs.
    /// Returns the number of faces removed.
    pub fn delete_subject(&self, name: &str) -> Result<usize> {
        let removed = self.mutate("delete_subject", name, |state| state.remove_subject(name))?;
        for face in &removed.faces {
            self.blobs.discard(&face.image_ref);
        }
        tracing::info!(subject = name, faces = removed.faces.len(), "subject deleted");
        Ok(removed.faces.len())
    }

    pub fn rename_subject(&self, old: &str, new: &str) -> Result<()> {
        let new = validate_name(new)?;
        self.mutate("rename_subject", old, |state| state.rename_subject(old, new))?;
        tracing::info!(from = old, to = new, "subject renamed");
        Ok(())
    }

    /// Store a face under `subject`, creating the subject if it does not exist.
    ///
    /// The id is minted, the blob written, and the record stored under that
    /// same id while the write lock is held. If the snapshot write fails the
    /// blob is removed again.
    pub fn add_face(&self, subject: &str, embedding: Embedding, image: &[u8]) -> Result<FaceId> {
        let subject = validate_name(subject)?;
        embedding.validate()?;
        let mut written: Option<String> = None;

        let result = self.mutate("add_face", subject, |state| {
            if let Some(expected) = state.dimension() {
                let got = embedding.dimension();
                if got != expected {
                    return Err(ValidationError::DimensionMismatch { expected, got }.into());
                }
            }
            let id = state.mint_id();
            let image_ref = self.blobs.write(id, image)?;
            written = Some(image_ref.clone());
            state.insert_face(
                subject,
                FaceRecord {
                    id,
                    added_at: Utc::now(),
                    image_ref,
                    embedding,
                },
            );
            Ok(id)
        });

        match result {
            Ok(id) => {
                tracing::info!(subject, face_id = %id, "face added");
                Ok(id)
            }
            Err(e) => {
                if let Some(image_ref) = written {
                    self.blobs.discard(&image_ref);
                }
                Err(e)
            }
        }
    }

    /// Delete one face and its blob. Returns the owning subject's name.
    pub fn delete_face(&self, id: FaceId) -> Result<String> {
        let target = id.to_string();
        let (subject, record) = self.mutate("delete_face", &target, |state| state.remove_face(id))?;
        self.blobs.discard(&record.image_ref);
        tracing::info!(subject = %subject, face_id = %id, "face deleted");
        Ok(subject)
    }

    /// Delete every face of a subject, keeping the (now empty) subject.
    pub fn delete_all_faces_of_subject(&self, subject: &str) -> Result<usize> {
        let removed = self.mutate("delete_all_faces_of_subject", subject, |state| {
            state.clear_faces(subject)
        })?;
        for face in &removed {
            self.blobs.discard(&face.image_ref);
        }
        tracing::info!(subject, faces = removed.len(), "faces of subject deleted");
        Ok(removed.len())
    }

    pub fn get_face_by_id(&self, id: FaceId) -> Result<OwnedFace> {
        self.read()?
            .find_face(id)
            .ok_or(FacebankError::FaceNotFound(id))
    }

    /// Faces in subject then insertion order. An unknown `subject` filter
    /// yields an empty list.
    pub fn list_faces(&self, subject: Option<&str>) -> Result<Vec<FaceSummary>> {
        let state = self.read()?;
        Ok(state
            .subjects
            .iter()
            .filter(|s| subject.map_or(true, |want| s.name == want))
            .flat_map(|s| {
                s.faces.iter().map(|f| FaceSummary {
                    image_id: f.id,
                    subject: s.name.clone(),
                    added_at: f.added_at,
                })
            })
            .collect())
    }

    /// Every stored embedding, in subject then insertion order.
    pub fn get_all_embeddings(&self) -> Result<Vec<StoredEmbedding>> {
        let state = self.read()?;
        Ok(state
            .subjects
            .iter()
            .flat_map(|s| {
                s.faces.iter().map(|f| StoredEmbedding {
                    subject: s.name.clone(),
                    id: f.id,
                    embedding: f.embedding.clone(),
                })
            })
            .collect())
    }

    /// Image bytes of a stored face.
    pub fn face_image(&self, id: FaceId) -> Result<FaceImage> {
        let image_ref = self.get_face_by_id(id)?.record.image_ref;
        let bytes = self
            .blobs
            .read(&image_ref)?
            .ok_or(FacebankError::ImageNotFound(id))?;
        Ok(FaceImage {
            content_type: blobs::content_type(&bytes),
            bytes,
        })
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let state = self.read()?;
        Ok(StoreStats {
            subjects: state.subjects.len(),
            faces: state.face_count(),
            dimension: state.dimension(),
        })
    }
}
