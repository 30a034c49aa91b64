use crate::error::Error;
use anyhow::Result;
use async_trait::async_trait;
use log::debug;
use std::path::{Component, Path, PathBuf};

pub mod archiver;

pub use archiver::RawArchiver;

/// Path-addressed cold storage with overwrite semantics
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write `bytes` at `path`, replacing anything already there
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<()>;
}

/// Blob store rooted at a local (or mounted) directory
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Create a store rooted at `root`; the directory is created on demand
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a blob path onto the filesystem, refusing anything that escapes the root
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if path.is_empty() || escapes {
            return Err(Error::Storage(format!("Invalid blob path: {}", path)).into());
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let target = self.resolve(path)?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Storage(format!("Failed to create directory {}: {}", parent.display(), e))
            })?;
        }

        // Write to a sibling temp file first so readers never see a torn blob
        let staging = target.with_extension("partial");
        tokio::fs::write(&staging, bytes)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write {}: {}", staging.display(), e)))?;
        tokio::fs::rename(&staging, &target)
            .await
            .map_err(|e| Error::Storage(format!("Failed to move blob into {}: {}", target.display(), e)))?;

        debug!("Stored {} bytes at {}", bytes.len(), target.display());
        Ok(())
    }
}

/// Keep a path segment from splitting or escaping the partition layout
pub(crate) fn sanitize_segment(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    match cleaned.trim() {
        "" | "." | ".." => "Unknown".to_string(),
        trimmed => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_creates_partitions_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        store.put("2024/03/05/14/D1/a.json", b"first").await.unwrap();
        store.put("2024/03/05/14/D1/a.json", b"second").await.unwrap();

        let stored = std::fs::read(dir.path().join("2024/03/05/14/D1/a.json")).unwrap();
        assert_eq!(stored, b"second");
        assert!(!dir.path().join("2024/03/05/14/D1/a.partial").exists());
    }

    #[tokio::test]
    async fn paths_outside_the_root_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        assert!(store.put("../escape.json", b"x").await.is_err());
        assert!(store.put("/etc/passwd", b"x").await.is_err());
        assert!(store.put("", b"x").await.is_err());
    }

    #[test]
    fn segments_are_sanitized() {
        assert_eq!(sanitize_segment("TRAP-SB-001-01"), "TRAP-SB-001-01");
        assert_eq!(sanitize_segment("a/b\\c"), "a_b_c");
        assert_eq!(sanitize_segment(".."), "Unknown");
        assert_eq!(sanitize_segment("  "), "Unknown");
    }
}
