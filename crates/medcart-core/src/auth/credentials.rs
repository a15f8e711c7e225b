use async_trait::async_trait;
use keyring::Entry;

use super::store::{SecureStorage, StorageError};

/// Keychain service name used when none is configured
pub const DEFAULT_SERVICE_NAME: &str = "medcart";

/// Stores each key as its own entry in the OS keychain.
///
/// Keychain calls block, so they run on the blocking thread pool.
#[derive(Debug, Clone)]
pub struct KeyringStorage {
    service: String,
}

impl KeyringStorage {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    async fn with_entry<T, F>(&self, key: &str, op: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(Entry) -> Result<T, keyring::Error> + Send + 'static,
    {
        let service = self.service.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let entry = Entry::new(&service, &key)
                .map_err(|e| StorageError::Keychain(e.to_string()))?;
            op(entry).map_err(|e| StorageError::Keychain(e.to_string()))
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

impl Default for KeyringStorage {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE_NAME)
    }
}

#[async_trait]
impl SecureStorage for KeyringStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.with_entry(key, |entry| match entry.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e),
        })
        .await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let value = value.to_string();
        self.with_entry(key, move |entry| entry.set_password(&value))
            .await
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.with_entry(key, |entry| match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e),
        })
        .await
    }
}
