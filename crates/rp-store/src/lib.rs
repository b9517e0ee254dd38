// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Local artifact storage.
//!
//! One directory, append-mostly. Every saved file gets a content-neutral
//! local name (eight hex characters of a fresh UUID plus the original
//! extension), so backend filenames can collide freely across jobs. Writes
//! go to a temp file first and are renamed into place; readers never see a
//! half-written artifact.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Artifact store failures.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactStoreError {
    /// Underlying filesystem failure.
    #[error("artifact store io: {0}")]
    Io(#[from] std::io::Error),
    /// The requested local file does not exist.
    #[error("artifact file not found: {0}")]
    NotFound(String),
}

/// A saved file, as the metadata store wants to record it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredFile {
    /// Globally-unique local filename (`a1b2c3d4.png`).
    pub local_filename: String,
    /// Absolute path.
    pub local_path: PathBuf,
    /// Size in bytes.
    pub size: u64,
}

/// The artifact directory.
#[derive(Clone, Debug)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (creating if needed) the store rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, ArtifactStoreError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        info!(root = %root.display(), "artifact store opened");
        Ok(Self { root })
    }

    /// The store's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Save bytes under a fresh local name derived from `original_filename`'s
    /// extension. Write-to-temp plus rename; the final name never holds a
    /// partial file.
    pub async fn save(
        &self,
        bytes: &[u8],
        original_filename: &str,
    ) -> Result<StoredFile, ArtifactStoreError> {
        let ext = Path::new(original_filename)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let local_filename = loop {
            let candidate = format!("{}{ext}", &Uuid::new_v4().simple().to_string()[..8]);
            if !self.root.join(&candidate).exists() {
                break candidate;
            }
        };
        let final_path = self.root.join(&local_filename);
        let tmp_path = self.root.join(format!(".{local_filename}.tmp"));

        let mut tmp = tokio::fs::File::create(&tmp_path).await?;
        tmp.write_all(bytes).await?;
        tmp.flush().await?;
        drop(tmp);
        tokio::fs::rename(&tmp_path, &final_path).await?;

        debug!(
            local = %local_filename,
            original = original_filename,
            size = bytes.len(),
            "artifact saved"
        );
        Ok(StoredFile {
            local_filename,
            local_path: final_path,
            size: bytes.len() as u64,
        })
    }

    /// Read a stored file back.
    pub async fn serve(&self, local_filename: &str) -> Result<Vec<u8>, ArtifactStoreError> {
        let path = self.resolve(local_filename)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ArtifactStoreError::NotFound(local_filename.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Absolute path for a stored file, if it exists.
    pub fn path_of(&self, local_filename: &str) -> Option<PathBuf> {
        let path = self.resolve(local_filename).ok()?;
        path.exists().then_some(path)
    }

    /// Delete a stored file. `Ok(false)` when it was already gone.
    pub async fn delete(&self, local_filename: &str) -> Result<bool, ArtifactStoreError> {
        let path = self.resolve(local_filename)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove files whose mtime is older than `older_than`, skipping any
    /// filename in `referenced` (the metadata store's live set). Returns the
    /// removed filenames.
    pub async fn sweep(
        &self,
        older_than: Duration,
        referenced: &std::collections::HashSet<String>,
    ) -> Result<Vec<String>, ArtifactStoreError> {
        let cutoff = SystemTime::now()
            .checked_sub(older_than)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || referenced.contains(&name) {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            if !meta.is_file() {
                continue;
            }
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            if mtime < cutoff {
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => {
                        info!(file = %name, "swept old artifact");
                        removed.push(name);
                    }
                    Err(e) => warn!(file = %name, error = %e, "sweep failed for file"),
                }
            }
        }
        Ok(removed)
    }

    /// Reject path traversal in caller-supplied names.
    fn resolve(&self, local_filename: &str) -> Result<PathBuf, ArtifactStoreError> {
        if local_filename.contains('/') || local_filename.contains("..") {
            return Err(ArtifactStoreError::NotFound(local_filename.to_string()));
        }
        Ok(self.root.join(local_filename))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[tokio::test]
    async fn save_serve_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();

        let stored = store.save(b"picture bytes", "render_00001.png").await.unwrap();
        assert!(stored.local_filename.ends_with(".png"));
        assert_eq!(stored.local_filename.len(), 8 + 4);
        assert_eq!(stored.size, 13);

        let bytes = store.serve(&stored.local_filename).await.unwrap();
        assert_eq!(bytes, b"picture bytes");

        assert!(store.delete(&stored.local_filename).await.unwrap());
        assert!(!store.delete(&stored.local_filename).await.unwrap());
        assert!(matches!(
            store.serve(&stored.local_filename).await,
            Err(ArtifactStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn names_are_unique_even_for_same_original() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();
        let a = store.save(b"a", "out.png").await.unwrap();
        let b = store.save(b"b", "out.png").await.unwrap();
        assert_ne!(a.local_filename, b.local_filename);
    }

    #[tokio::test]
    async fn extensionless_files_get_bare_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();
        let stored = store.save(b"x", "LICENSE").await.unwrap();
        assert_eq!(stored.local_filename.len(), 8);
    }

    #[tokio::test]
    async fn sweep_respects_referenced_set() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();
        let kept = store.save(b"keep", "keep.png").await.unwrap();
        let gone = store.save(b"gone", "gone.png").await.unwrap();

        let mut referenced = HashSet::new();
        referenced.insert(kept.local_filename.clone());

        // Zero cutoff: everything qualifies by age.
        let removed = store.sweep(Duration::ZERO, &referenced).await.unwrap();
        assert_eq!(removed, vec![gone.local_filename.clone()]);
        assert!(store.serve(&kept.local_filename).await.is_ok());
        assert!(store.serve(&gone.local_filename).await.is_err());
    }

    #[tokio::test]
    async fn traversal_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();
        assert!(store.serve("../etc/passwd").await.is_err());
    }
}
