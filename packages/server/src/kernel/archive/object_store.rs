//! Object storage contract and the built-in backends.
//!
//! Keys are opaque `/`-separated strings, bytes are opaque. The archiver
//! assumes nothing beyond this trait: no versioning, no lifecycle rules.
//! Cloud backends implement the same seam out of tree.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use tokio::fs;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One listed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: i64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<(), StorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Create-if-absent for the backing container.
    async fn ensure_container(&self) -> Result<(), StorageError>;
}

// ============================================================================
// In-memory backend
// ============================================================================

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    content_type: String,
    metadata: HashMap<String, String>,
}

/// Map-backed store for tests and local development.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, StoredObject>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_count(&self) -> usize {
        self.objects.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn content_type_of(&self, key: &str) -> Option<String> {
        self.objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|o| o.content_type.clone())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<(), StorageError> {
        self.objects.write().unwrap_or_else(|e| e.into_inner()).insert(
            key.to_string(),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
                metadata: metadata.clone(),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|o| o.bytes.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self
            .objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key))
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        Ok(self
            .objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| ObjectInfo {
                key: key.clone(),
                size: object.bytes.len() as i64,
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.objects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }

    async fn ensure_container(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

// ============================================================================
// Local filesystem backend
// ============================================================================

/// Filesystem store so the worker binary runs end-to-end without a cloud
/// account. Keys map to paths under the root; content types and custom
/// metadata are not persisted by this backend.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        if key.is_empty() || key.starts_with('/') {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        if key.split('/').any(|segment| segment == ".." || segment == "." || segment.is_empty()) {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }

    fn walk(dir: &Path, out: &mut Vec<(PathBuf, i64)>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                Self::walk(&path, out)?;
            } else if file_type.is_file() {
                let size = entry.metadata()?.len() as i64;
                out.push((path, size));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        _content_type: &str,
        _metadata: &HashMap<String, String>,
    ) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, bytes).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.path_for(key)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        let root = self.root.clone();
        if !root.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        Self::walk(&root, &mut files)?;

        let mut objects: Vec<ObjectInfo> = files
            .into_iter()
            .filter_map(|(path, size)| {
                let relative = path.strip_prefix(&root).ok()?;
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                key.starts_with(prefix).then_some(ObjectInfo { key, size })
            })
            .collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_container(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryObjectStore::new();
        store
            .put("a/b.txt", b"hello".to_vec(), "text/plain", &HashMap::new())
            .await
            .unwrap();

        assert!(store.exists("a/b.txt").await.unwrap());
        assert_eq!(store.get("a/b.txt").await.unwrap(), b"hello");
        assert_eq!(store.content_type_of("a/b.txt").unwrap(), "text/plain");

        store.delete("a/b.txt").await.unwrap();
        assert!(!store.exists("a/b.txt").await.unwrap());
    }

    #[tokio::test]
    async fn memory_store_lists_by_prefix() {
        let store = MemoryObjectStore::new();
        for key in ["cases/c1/a", "cases/c1/b", "cases/c2/a"] {
            store
                .put(key, vec![1, 2], "application/octet-stream", &HashMap::new())
                .await
                .unwrap();
        }

        let listed = store.list_by_prefix("cases/c1/").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|o| o.key.starts_with("cases/c1/")));
        assert!(listed.iter().all(|o| o.size == 2));
    }

    #[tokio::test]
    async fn local_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        store.ensure_container().await.unwrap();

        store
            .put(
                "cases/c1/emails/m1/content.txt",
                b"body".to_vec(),
                "text/plain",
                &HashMap::new(),
            )
            .await
            .unwrap();

        assert!(store.exists("cases/c1/emails/m1/content.txt").await.unwrap());
        assert_eq!(
            store.get("cases/c1/emails/m1/content.txt").await.unwrap(),
            b"body"
        );

        let listed = store.list_by_prefix("cases/c1/").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "cases/c1/emails/m1/content.txt");
        assert_eq!(listed[0].size, 4);
    }

    #[tokio::test]
    async fn local_store_rejects_traversal_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());

        for key in ["../outside", "a/../b", "/absolute", ""] {
            assert!(matches!(
                store.get(key).await,
                Err(StorageError::InvalidKey(_))
            ));
        }
    }

    #[tokio::test]
    async fn local_store_missing_object_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        assert!(matches!(
            store.get("missing/key").await,
            Err(StorageError::NotFound(_))
        ));
    }
}
