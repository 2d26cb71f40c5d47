use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::StoreError;

/// External binary storage for attachments and raw archives.
///
/// Keys are deterministic (`{uploadId}-{fieldName}` for attachments), so a
/// retried write overwrites the same object instead of duplicating it.
/// Encryption at rest is the store's own concern.
pub trait BlobStore: Send + Sync {
    fn write_bytes(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError>;
    fn write_file(&self, bucket: &str, key: &str, path: &Path) -> Result<(), StoreError>;
    fn read_bytes(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError>;
}

/// Directory-backed blob store: one subdirectory per bucket.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key)
    }
}

impl BlobStore for FsBlobStore {
    fn write_bytes(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.object_path(bucket, key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, bytes)?;
        Ok(())
    }

    fn write_file(&self, bucket: &str, key: &str, source: &Path) -> Result<(), StoreError> {
        let bytes = std::fs::read(source)?;
        self.write_bytes(bucket, key, &bytes)
    }

    fn read_bytes(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.object_path(bucket, key);
        if !path.exists() {
            return Err(StoreError::BlobNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        Ok(std::fs::read(path)?)
    }
}

/// In-memory blob store for tests.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let objects = self.objects.lock().unwrap();
        let mut keys: Vec<String> = objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}

impl BlobStore for MemoryBlobStore {
    fn write_bytes(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.to_string(), key.to_string()), bytes.to_vec());
        Ok(())
    }

    fn write_file(&self, bucket: &str, key: &str, path: &Path) -> Result<(), StoreError> {
        let bytes = std::fs::read(path)?;
        self.write_bytes(bucket, key, &bytes)
    }

    fn read_bytes(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::BlobNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryBlobStore::new();
        store.write_bytes("attachments", "u1-field", b"payload").unwrap();
        assert_eq!(store.read_bytes("attachments", "u1-field").unwrap(), b"payload");
        assert_eq!(store.keys("attachments"), vec!["u1-field".to_string()]);
    }

    #[test]
    fn memory_store_missing_key() {
        let store = MemoryBlobStore::new();
        let err = store.read_bytes("attachments", "nope").unwrap_err();
        assert!(matches!(err, StoreError::BlobNotFound { .. }));
    }

    #[test]
    fn fs_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        store.write_bytes("attachments", "u1-field", b"payload").unwrap();
        assert_eq!(store.read_bytes("attachments", "u1-field").unwrap(), b"payload");

        // Overwrite by deterministic key.
        store.write_bytes("attachments", "u1-field", b"payload2").unwrap();
        assert_eq!(store.read_bytes("attachments", "u1-field").unwrap(), b"payload2");
    }

    #[test]
    fn fs_store_write_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path().join("blobs"));

        let source = dir.path().join("source.bin");
        std::fs::write(&source, b"file contents").unwrap();

        store.write_file("uploads", "raw-1", &source).unwrap();
        assert_eq!(store.read_bytes("uploads", "raw-1").unwrap(), b"file contents");
    }
}
