use async_trait::async_trait;
use std::fs;
use std::io;
use std::path::PathBuf;

use crate::types::SagaError;

/// Persistence collaborator for execution snapshots.
///
/// Snapshots are JSON documents keyed by execution ID. Any real
/// datastore sits behind this trait; the orchestrator itself only
/// requires best-effort durability.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Store a snapshot under the given key
    async fn store(&self, key: &str, data: &[u8]) -> Result<(), SagaError>;

    /// Load the snapshot for the given key
    async fn load(&self, key: &str) -> Result<Vec<u8>, SagaError>;

    /// Delete the snapshot for the given key
    async fn delete(&self, key: &str) -> Result<(), SagaError>;

    /// List all snapshot keys
    async fn list(&self) -> Result<Vec<String>, SagaError>;
}

/// File-based storage backend
pub struct FileStorage {
    /// Base directory for snapshots
    base_dir: PathBuf,
}

impl FileStorage {
    /// Create a new file storage backend
    pub fn new(base_dir: PathBuf) -> Self {
        FileStorage { base_dir }
    }

    fn get_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", key))
    }
}

#[async_trait]
impl StorageBackend for FileStorage {
    async fn store(&self, key: &str, data: &[u8]) -> Result<(), SagaError> {
        let path = self.get_path(key);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| SagaError::Storage(e.to_string()))?;
        }

        // Write atomically using a temporary file
        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, data)
            .await
            .map_err(|e| SagaError::Storage(e.to_string()))?;

        // Ensure the data is synced to disk before the rename
        let file = tokio::fs::File::open(&temp_path)
            .await
            .map_err(|e| SagaError::Storage(e.to_string()))?;
        file.sync_all()
            .await
            .map_err(|e| SagaError::Storage(e.to_string()))?;

        tokio::fs::rename(&temp_path, &path)
            .await
            .map_err(|e| SagaError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Vec<u8>, SagaError> {
        let path = self.get_path(key);

        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(SagaError::UnknownExecution(key.to_string()))
            }
            Err(e) => Err(SagaError::Storage(e.to_string())),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), SagaError> {
        let path = self.get_path(key);

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            // Already gone counts as deleted
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SagaError::Storage(e.to_string())),
        }
    }

    async fn list(&self) -> Result<Vec<String>, SagaError> {
        let mut entries = Vec::new();

        let mut dir = tokio::fs::read_dir(&self.base_dir)
            .await
            .map_err(|e| SagaError::Storage(e.to_string()))?;

        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| SagaError::Storage(e.to_string()))?
        {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(key) = name.strip_suffix(".json") {
                    entries.push(key.to_string());
                }
            }
        }

        Ok(entries)
    }
}

/// In-memory storage backend (for testing)
#[derive(Default)]
pub struct MemoryStorage {
    /// Snapshot store
    data: tokio::sync::RwLock<std::collections::HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    /// Create a new in-memory storage backend
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn store(&self, key: &str, data: &[u8]) -> Result<(), SagaError> {
        let mut map = self.data.write().await;
        map.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Vec<u8>, SagaError> {
        let map = self.data.read().await;

        match map.get(key) {
            Some(data) => Ok(data.clone()),
            None => Err(SagaError::UnknownExecution(key.to_string())),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), SagaError> {
        let mut map = self.data.write().await;
        map.remove(key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, SagaError> {
        let map = self.data.read().await;
        Ok(map.keys().cloned().collect())
    }
}
