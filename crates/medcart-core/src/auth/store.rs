//! Key/value storage backends for session tokens.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Token file name in the data directory
const TOKEN_FILE: &str = "session.json";

/// Written first, then renamed over the token file
const TOKEN_TEMP_SUFFIX: &str = "tmp";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Keychain error: {0}")]
    Keychain(String),

    #[error("Storage task failed: {0}")]
    Task(String),
}

/// Async string storage, the persistence seam for the token vault.
#[async_trait]
pub trait SecureStorage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Process-local storage. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecureStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.values
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.values.lock().await.remove(key);
        Ok(())
    }
}

/// Stores all keys in a single JSON object on disk.
///
/// The whole file is rewritten on every change through a temp file and a
/// rename, so readers never see a partial write. The lock serializes
/// read-modify-write cycles within the process.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStorage {
    /// Use `session.json` inside `data_dir`.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self::at_path(data_dir.as_ref().join(TOKEN_FILE))
    }

    pub fn at_path(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<HashMap<String, String>, StorageError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(HashMap::new());
        }
        Ok(serde_json::from_str(&contents)?)
    }

    /// Read the map for a write. A corrupt file is discarded (flag set)
    /// rather than left to block every later login.
    fn read_map_for_update(&self) -> Result<(HashMap<String, String>, bool), StorageError> {
        match self.read_map() {
            Ok(map) => Ok((map, false)),
            Err(StorageError::Corrupt(e)) => {
                warn!(path = ?self.path, error = %e, "Token file is corrupt, discarding it");
                Ok((HashMap::new(), true))
            }
            Err(e) => Err(e),
        }
    }

    fn write_map(&self, map: &HashMap<String, String>) -> Result<(), StorageError> {
        if map.is_empty() {
            if self.path.exists() {
                std::fs::remove_file(&self.path)?;
                debug!(path = ?self.path, "Removed empty token file");
            }
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(map)?;
        let temp = self.temp_path();
        std::fs::write(&temp, contents)?;
        std::fs::rename(&temp, &self.path)?;
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".");
        name.push(TOKEN_TEMP_SUFFIX);
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl SecureStorage for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let _guard = self.lock.lock().await;
        Ok(self.read_map()?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let (mut map, _) = self.read_map_for_update()?;
        map.insert(key.to_string(), value.to_string());
        self.write_map(&map)
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let (mut map, discarded) = self.read_map_for_update()?;
        if map.remove(key).is_some() || discarded {
            self.write_map(&map)?;
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_storage_set_get_remove() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get("accessToken").await.unwrap(), None);

        storage.set("accessToken", "abc").await.unwrap();
        assert_eq!(storage.get("accessToken").await.unwrap().as_deref(), Some("abc"));

        storage.remove("accessToken").await.unwrap();
        storage.remove("accessToken").await.unwrap();
        assert_eq!(storage.get("accessToken").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_storage_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path());
        storage.set("accessToken", "a1").await.unwrap();
        storage.set("refreshToken", "r1").await.unwrap();

        let reopened = FileStorage::new(dir.path());
        assert_eq!(reopened.get("accessToken").await.unwrap().as_deref(), Some("a1"));
        assert_eq!(reopened.get("refreshToken").await.unwrap().as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn test_file_storage_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path());
        storage.set("accessToken", "a1").await.unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from(TOKEN_FILE)]);
    }

    #[tokio::test]
    async fn test_file_storage_removes_file_when_empty() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path());
        storage.set("accessToken", "a1").await.unwrap();
        assert!(storage.path().exists());

        storage.remove("accessToken").await.unwrap();
        assert!(!storage.path().exists());
    }

    #[tokio::test]
    async fn test_file_storage_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path());
        std::fs::write(storage.path(), "{not json").unwrap();

        let result = storage.get("accessToken").await;
        assert!(matches!(result, Err(StorageError::Corrupt(_))));
    }

    #[tokio::test]
    async fn test_file_storage_set_replaces_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path());
        std::fs::write(storage.path(), r#"{"accessToken": "a"#).unwrap();

        storage.set("accessToken", "a2").await.unwrap();

        assert_eq!(storage.get("accessToken").await.unwrap().as_deref(), Some("a2"));
        assert_eq!(storage.get("refreshToken").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_storage_remove_purges_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path());
        std::fs::write(storage.path(), "{not json").unwrap();

        storage.remove("refreshToken").await.unwrap();

        assert!(!storage.path().exists());
        assert_eq!(storage.get("accessToken").await.unwrap(), None);
    }
}
