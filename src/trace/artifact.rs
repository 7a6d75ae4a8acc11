//! Content-addressed artifact storage.
//!
//! Large payloads (prompts, verbatim LLM responses, tool outputs, file
//! snapshots, checkpoint snapshots) live outside the event log as opaque
//! blobs keyed by the SHA-256 of their contents. Identical content yields
//! the identical identifier, so the store deduplicates across sessions.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Content hash identifying an artifact (64 lowercase hex chars).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactId(pub String);

impl ArtifactId {
    /// Compute the identifier for the given content.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Parse from string, validating shape.
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(Self(s.to_ascii_lowercase()))
        } else {
            Err(Error::NotFound(format!("malformed artifact id '{}'", s)))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0[..16])
    }
}

/// Filesystem-backed content-addressed blob store.
///
/// Blobs are written under `root/ab/cdef...` (two-level fan-out on the hash
/// prefix) via a temp file and an atomic rename, so a crashed write never
/// leaves a partial blob under its final name.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (creating if necessary) a blob store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| Error::Storage(format!("create blob root '{}': {}", root.display(), e)))?;
        Ok(Self { root })
    }

    fn blob_path(&self, id: &ArtifactId) -> PathBuf {
        self.root.join(&id.0[..2]).join(&id.0[2..])
    }

    /// Store content, returning its identifier. Idempotent: storing the same
    /// bytes twice is a no-op returning the same id.
    pub fn put(&self, bytes: &[u8]) -> Result<ArtifactId> {
        let id = ArtifactId::from_bytes(bytes);
        let path = self.blob_path(&id);
        if path.exists() {
            return Ok(id);
        }

        let dir = path
            .parent()
            .ok_or_else(|| Error::Internal("blob path has no parent".into()))?;
        fs::create_dir_all(dir)
            .map_err(|e| Error::Storage(format!("create blob dir '{}': {}", dir.display(), e)))?;

        let tmp = dir.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        fs::write(&tmp, bytes)
            .map_err(|e| Error::Storage(format!("write blob '{}': {}", tmp.display(), e)))?;
        fs::rename(&tmp, &path)
            .map_err(|e| Error::Storage(format!("commit blob '{}': {}", path.display(), e)))?;

        Ok(id)
    }

    /// Fetch content by identifier.
    pub fn get(&self, id: &ArtifactId) -> Result<Vec<u8>> {
        let path = self.blob_path(id);
        fs::read(&path).map_err(|_| Error::NotFound(format!("artifact {}", id.as_str())))
    }

    /// Whether the store holds the given artifact.
    pub fn contains(&self, id: &ArtifactId) -> bool {
        self.blob_path(id).exists()
    }

    /// Fetch and decode UTF-8 content.
    pub fn get_string(&self, id: &ArtifactId) -> Result<String> {
        let bytes = self.get(id)?;
        String::from_utf8(bytes)
            .map_err(|e| Error::Internal(format!("artifact {} is not UTF-8: {}", id, e)))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn temp_store() -> (tempfile::TempDir, ArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path().join("blobs")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_put_is_idempotent() {
        let (_dir, store) = temp_store();
        let a = store.put(b"same content").unwrap();
        let b = store.put(b"same content").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.get(&a).unwrap(), b"same content");
    }

    #[test]
    fn test_distinct_content_distinct_ids() {
        let (_dir, store) = temp_store();
        let a = store.put(b"alpha").unwrap();
        let b = store.put(b"beta").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let (_dir, store) = temp_store();
        let id = ArtifactId::from_bytes(b"never stored");
        assert!(matches!(store.get(&id), Err(Error::NotFound(_))));
        assert!(!store.contains(&id));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(ArtifactId::parse("not-a-hash").is_err());
        let valid = ArtifactId::from_bytes(b"x");
        assert_eq!(ArtifactId::parse(valid.as_str()).unwrap(), valid);
    }
}
