// landscape-payload/src/lib.rs
// ============================================================================
// Module: Landscape Payload
// Description: Filesystem-backed, content-addressed blob store.
// Purpose: Persist the raw bytes behind `source_data_hash`/`output_hash`/
//          `content_hash` references so a run's audit trail can point at
//          data without embedding it, while still being able to retrieve
//          and integrity-check it later.
// Dependencies: landscape-core, subtle, thiserror
// ============================================================================

//! ## Overview
//! Blobs are named by their own SHA-256 hex hash and sharded under the
//! first two hex characters to keep any one directory's fan-out bounded.
//! Writes go through a temp-file-then-rename sequence in the same shard
//! directory so a crash never leaves a partially-written blob visible at
//! its final path. Reads recompute the hash and compare it to the
//! requested key in constant time before returning the bytes, matching the
//! hash-verify-on-read discipline the audit trail itself uses.

use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use landscape_core::PayloadStore;
use landscape_core::PayloadStoreError;
use landscape_core::hash_bytes;
use subtle::ConstantTimeEq;

/// Maximum allowed length, in bytes, of a single path component.
const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum allowed total length, in bytes, of the store's root path.
const MAX_TOTAL_PATH_LENGTH: usize = 4096;

/// Errors raised while constructing a [`FilesystemPayloadStore`].
#[derive(Debug, thiserror::Error)]
pub enum PayloadStoreSetupError {
    /// The configured root path failed validation.
    #[error("invalid payload store root: {0}")]
    InvalidRoot(String),
    /// Creating the root directory failed.
    #[error("could not create payload store root: {0}")]
    Io(String),
}

/// A content-addressed payload store rooted at a directory on the local
/// filesystem.
#[derive(Debug, Clone)]
pub struct FilesystemPayloadStore {
    root: PathBuf,
}

impl FilesystemPayloadStore {
    /// Opens (creating if necessary) a payload store rooted at `root`.
    ///
    /// # Errors
    /// Returns [`PayloadStoreSetupError`] if `root` fails path validation
    /// (component or total length, or already exists as a non-directory) or
    /// cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, PayloadStoreSetupError> {
        let root = root.into();
        validate_root_path(&root)?;
        fs::create_dir_all(&root).map_err(|err| PayloadStoreSetupError::Io(err.to_string()))?;
        Ok(Self { root })
    }

    /// Returns the directory a blob with hash `hash` would be sharded under.
    fn shard_dir(&self, hash: &str) -> PathBuf {
        let prefix = if hash.len() >= 2 { &hash[..2] } else { hash };
        self.root.join(prefix)
    }

    /// Returns the final path a blob with hash `hash` would live at.
    fn blob_path(&self, hash: &str) -> PathBuf {
        self.shard_dir(hash).join(hash)
    }
}

impl PayloadStore for FilesystemPayloadStore {
    fn put(&self, bytes: &[u8]) -> Result<String, PayloadStoreError> {
        let hash = hash_bytes(bytes);
        let path = self.blob_path(&hash);
        if path.exists() {
            return Ok(hash);
        }

        let shard_dir = self.shard_dir(&hash);
        fs::create_dir_all(&shard_dir).map_err(io_err)?;

        let mut tmp_path = shard_dir.join(format!(".{hash}.tmp"));
        let mut suffix = 0_u32;
        while tmp_path.exists() {
            suffix += 1;
            tmp_path = shard_dir.join(format!(".{hash}.tmp{suffix}"));
        }
        fs::write(&tmp_path, bytes).map_err(io_err)?;
        fs::rename(&tmp_path, &path).map_err(io_err)?;
        Ok(hash)
    }

    fn get(&self, hash: &str) -> Result<Option<Vec<u8>>, PayloadStoreError> {
        let path = self.blob_path(hash);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_err(err)),
        };

        let actual = hash_bytes(&bytes);
        if bool::from(actual.as_bytes().ct_eq(hash.as_bytes())) {
            Ok(Some(bytes))
        } else {
            Err(PayloadStoreError::HashMismatch {
                expected: hash.to_string(),
                actual,
            })
        }
    }

    fn exists(&self, hash: &str) -> Result<bool, PayloadStoreError> {
        Ok(self.blob_path(hash).exists())
    }

    fn delete(&self, hash: &str) -> Result<(), PayloadStoreError> {
        match fs::remove_file(self.blob_path(hash)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_err(err)),
        }
    }
}

fn io_err(err: io::Error) -> PayloadStoreError {
    PayloadStoreError::Backend(err.to_string())
}

/// Validates a configured store root the same way the audit trail's own
/// `SqliteStoreConfig` validates its database path: bounded component and
/// total length, and no collision with an existing non-directory.
fn validate_root_path(path: &Path) -> Result<(), PayloadStoreSetupError> {
    if path.as_os_str().is_empty() {
        return Err(PayloadStoreSetupError::InvalidRoot("root path must not be empty".to_string()));
    }
    let path_string = path.display().to_string();
    if path_string.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(PayloadStoreSetupError::InvalidRoot("root path exceeds length limit".to_string()));
    }
    for component in path.components() {
        let name = component.as_os_str().to_string_lossy();
        if name.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(PayloadStoreSetupError::InvalidRoot(
                "root path contains an overlong component".to_string(),
            ));
        }
    }
    if path.exists() && !path.is_dir() {
        return Err(PayloadStoreSetupError::InvalidRoot(
            "root path must be a directory".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test assertions only")]

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn put_is_idempotent_and_content_addressed() {
        let dir = tempdir().unwrap();
        let store = FilesystemPayloadStore::open(dir.path().join("payloads")).unwrap();

        let first = store.put(b"hello").unwrap();
        let second = store.put(b"hello").unwrap();
        assert_eq!(first, second);
        assert_eq!(first, hash_bytes(b"hello"));
    }

    #[test]
    fn get_returns_none_for_missing_hash() {
        let dir = tempdir().unwrap();
        let store = FilesystemPayloadStore::open(dir.path().join("payloads")).unwrap();
        assert!(store.get(&"0".repeat(64)).unwrap().is_none());
    }

    #[test]
    fn get_roundtrips_stored_bytes() {
        let dir = tempdir().unwrap();
        let store = FilesystemPayloadStore::open(dir.path().join("payloads")).unwrap();
        let hash = store.put(b"some payload bytes").unwrap();
        let bytes = store.get(&hash).unwrap().unwrap();
        assert_eq!(bytes, b"some payload bytes");
    }

    #[test]
    fn get_detects_tampering_as_integrity_error() {
        let dir = tempdir().unwrap();
        let store = FilesystemPayloadStore::open(dir.path().join("payloads")).unwrap();
        let hash = store.put(b"original").unwrap();
        let path = store.blob_path(&hash);
        fs::write(&path, b"tampered").unwrap();

        let err = store.get(&hash).unwrap_err();
        assert!(matches!(err, PayloadStoreError::HashMismatch { .. }));
    }

    #[test]
    fn delete_is_false_free_on_already_absent() {
        let dir = tempdir().unwrap();
        let store = FilesystemPayloadStore::open(dir.path().join("payloads")).unwrap();
        store.delete(&"0".repeat(64)).unwrap();
        let hash = store.put(b"present").unwrap();
        store.delete(&hash).unwrap();
        assert!(store.get(&hash).unwrap().is_none());
    }

    #[test]
    fn exists_reflects_put_and_delete() {
        let dir = tempdir().unwrap();
        let store = FilesystemPayloadStore::open(dir.path().join("payloads")).unwrap();
        let hash = store.put(b"blob").unwrap();
        assert!(store.exists(&hash).unwrap());
        store.delete(&hash).unwrap();
        assert!(!store.exists(&hash).unwrap());
    }
}
