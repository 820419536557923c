//! Image blob storage: one file per face, named after the face id.

use crate::types::FaceId;
use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> BlobError + '_ {
    move |source| BlobError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Directory of face image blobs.
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    /// Open (creating if needed) the blob directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, BlobError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File name a blob for `id` gets, with an extension sniffed from the bytes.
    pub fn file_name_for(id: FaceId, bytes: &[u8]) -> String {
        let ext = image::guess_format(bytes)
            .ok()
            .and_then(|f| f.extensions_str().first().copied())
            .unwrap_or("bin");
        format!("{id}.{ext}")
    }

    /// Write a blob and fsync it. Returns the stored file name.
    pub fn write(&self, id: FaceId, bytes: &[u8]) -> Result<String, BlobError> {
        let name = Self::file_name_for(id, bytes);
        let path = self.dir.join(&name);
        let mut file = fs::File::create(&path).map_err(io_err(&path))?;
        file.write_all(bytes).map_err(io_err(&path))?;
        file.sync_all().map_err(io_err(&path))?;
        Ok(name)
    }

    /// Read a blob. `Ok(None)` if it is not on disk.
    pub fn read(&self, name: &str) -> Result<Option<Vec<u8>>, BlobError> {
        let path = self.dir.join(name);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    /// Remove a blob. A blob that is already gone is not an error.
    pub fn remove(&self, name: &str) -> Result<(), BlobError> {
        let path = self.dir.join(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    /// Remove a blob after its record is gone, logging instead of failing.
    /// A blob left behind here is collected by [`sweep_orphans`](Self::sweep_orphans).
    pub fn discard(&self, name: &str) {
        if let Err(e) = self.remove(name) {
            tracing::warn!(blob = name, error = %e, "failed to remove image blob");
        }
    }

    /// Delete every file in the blob directory not named in `live`.
    /// Returns how many were removed.
    pub fn sweep_orphans(&self, live: &HashSet<&str>) -> Result<usize, BlobError> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir).map_err(io_err(&self.dir))? {
            let entry = entry.map_err(io_err(&self.dir))?;
            if !entry.file_type().map_err(io_err(&self.dir))?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if live.contains(name) {
                continue;
            }
            match self.remove(name) {
                Ok(()) => {
                    tracing::info!(blob = name, "removed orphaned image blob");
                    removed += 1;
                }
                Err(e) => tracing::warn!(blob = name, error = %e, "failed to remove orphaned image blob"),
            }
        }
        Ok(removed)
    }
}

/// MIME type for a blob, sniffed from its leading bytes.
pub fn content_type(bytes: &[u8]) -> &'static str {
    image::guess_format(bytes)
        .map(|format| format.to_mime_type())
        .unwrap_or("application/octet-stream")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    #[test]
    fn test_write_read_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let blobs = BlobStore::open(tmp.path().join("images")).unwrap();
        let id = FaceId::mint();

        let name = blobs.write(id, PNG).unwrap();
        assert_eq!(name, format!("{id}.png"));
        assert_eq!(blobs.read(&name).unwrap().as_deref(), Some(PNG));

        blobs.remove(&name).unwrap();
        assert!(blobs.read(&name).unwrap().is_none());
        // Removing twice is fine.
        blobs.remove(&name).unwrap();
    }

    #[test]
    fn test_unknown_format_gets_bin_extension() {
        let id = FaceId::mint();
        assert_eq!(BlobStore::file_name_for(id, b"hello"), format!("{id}.bin"));
    }

    #[test]
    fn test_content_type() {
        assert_eq!(content_type(PNG), "image/png");
        assert_eq!(content_type(b"\xff\xd8\xff\xe0"), "image/jpeg");
        assert_eq!(content_type(b"garbage"), "application/octet-stream");
    }

    #[test]
    fn test_sweep_orphans_keeps_live() {
        let tmp = tempfile::tempdir().unwrap();
        let blobs = BlobStore::open(tmp.path()).unwrap();
        let keep = blobs.write(FaceId::mint(), PNG).unwrap();
        let orphan = blobs.write(FaceId::mint(), PNG).unwrap();

        let live: HashSet<&str> = [keep.as_str()].into_iter().collect();
        assert_eq!(blobs.sweep_orphans(&live).unwrap(), 1);
        assert!(blobs.read(&keep).unwrap().is_some());
        assert!(blobs.read(&orphan).unwrap().is_none());
    }

    #[test]
    fn test_sweep_counts_only_removed_files() {
        let tmp = tempfile::tempdir().unwrap();
        let blobs = BlobStore::open(tmp.path()).unwrap();
        blobs.write(FaceId::mint(), PNG).unwrap();
        blobs.write(FaceId::mint(), b"raw").unwrap();
        fs::create_dir(tmp.path().join("nested")).unwrap();

        assert_eq!(blobs.sweep_orphans(&HashSet::new()).unwrap(), 2);
        assert!(tmp.path().join("nested").is_dir());
        assert_eq!(blobs.sweep_orphans(&HashSet::new()).unwrap(), 0);
    }
}
