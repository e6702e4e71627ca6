use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::ErrorKind;

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KvKey {
    namespace: KeyNamespace,
    key: String,
}

impl KvKey {
    pub fn new(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, KvError> {
        let key = key.into();
        Self::validate_key(&key)?;
        Ok(Self { namespace, key })
    }

    #[must_use]
    pub fn raw(&self) -> String {
        format!("{}:{}", self.namespace.prefix(), self.key)
    }

    #[must_use]
    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    fn validate_key(key: &str) -> Result<(), KvError> {
        if key.trim().is_empty() {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be empty".to_string(),
            });
        }

        if key.len() > MAX_KEY_LENGTH {
            return Err(KvError::InvalidKey {
                key: key.chars().take(50).collect::<String>() + "...",
                reason: format!("key exceeds maximum length of {MAX_KEY_LENGTH} bytes"),
            });
        }

        if key.contains("..") {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot contain path traversal sequences".to_string(),
            });
        }

        if key.starts_with('/') || key.starts_with('\\') {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot start with path separator".to_string(),
            });
        }

        if key.chars().any(char::is_control) {
            return Err(KvError::InvalidKey {
                key: key.escape_debug().to_string(),
                reason: "key contains control characters".to_string(),
            });
        }

        Ok(())
    }
}

impl std::fmt::Display for KvKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.namespace.prefix(), self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyNamespace {
    Session,
    Settings,
    UserData,
}

impl KeyNamespace {
    #[must_use]
    pub fn prefix(&self) -> &'static str {
        match self {
            KeyNamespace::Session => "session",
            KeyNamespace::Settings => "settings",
            KeyNamespace::UserData => "userdata",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("storage error: {message} (code: {code:?}, retryable: {retryable})")]
    Storage {
        code: StorageErrorCode,
        message: String,
        retryable: bool,
    },
}

impl KvError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            KvError::Storage { retryable, .. } => *retryable,
            _ => false,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            KvError::InvalidKey { .. } | KvError::ValueTooLarge { .. } => ErrorKind::Validation,
            KvError::Storage { .. } => ErrorKind::Storage,
        }
    }

    pub fn storage(code: StorageErrorCode, message: impl Into<String>) -> Self {
        let retryable = code.is_retryable();
        Self::Storage {
            code,
            message: message.into(),
            retryable,
        }
    }

    pub(crate) fn check_size(value: &[u8]) -> Result<(), KvError> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(KvError::ValueTooLarge {
                size: value.len(),
                max: MAX_VALUE_SIZE,
            });
        }
        Ok(())
    }
}

impl From<std::io::Error> for KvError {
    fn from(e: std::io::Error) -> Self {
        let code = match e.kind() {
            std::io::ErrorKind::PermissionDenied => StorageErrorCode::PermissionDenied,
            std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock => {
                StorageErrorCode::Busy
            }
            _ => StorageErrorCode::IoError,
        };
        KvError::storage(code, e.to_string())
    }
}

impl From<tokio::task::JoinError> for KvError {
    fn from(e: tokio::task::JoinError) -> Self {
        KvError::storage(StorageErrorCode::Unknown, format!("storage task failed: {e}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageErrorCode {
    Unknown,
    Corrupted,
    DiskFull,
    PermissionDenied,
    Busy,
    Locked,
    IoError,
}

impl StorageErrorCode {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageErrorCode::Busy | StorageErrorCode::Locked)
    }
}

/// Durable or session-scoped key/value storage provided by the host.
///
/// A `set` replaces the whole value for its key in one step: readers see
/// either the previous value or the new one, never a mix.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError>;
    async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<(), KvError>;
    async fn delete(&self, key: &KvKey) -> Result<bool, KvError>;
}

/// Process-lifetime storage. Backs the session scope and tests.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.entries.read().await.get(&key.raw()).cloned())
    }

    async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<(), KvError> {
        KvError::check_size(&value)?;
        self.entries.write().await.insert(key.raw(), value);
        Ok(())
    }

    async fn delete(&self, key: &KvKey) -> Result<bool, KvError> {
        Ok(self.entries.write().await.remove(&key.raw()).is_some())
    }
}

/// One file per key under a directory. Writes go to a temp file that is
/// synced and renamed over the target.
#[derive(Debug, Clone)]
pub struct FileKvStore {
    dir: PathBuf,
}

impl FileKvStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, KvError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &KvKey) -> PathBuf {
        self.dir.join(format!("{}.json", hex::encode(key.raw())))
    }

    fn write_atomic(path: &Path, value: &[u8]) -> Result<(), KvError> {
        let tmp_path = path.with_extension("tmp");

        let mut file = File::create(&tmp_path)?;
        file.write_all(value)?;
        file.sync_all()?;

        std::fs::rename(&tmp_path, path)?;

        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileKvStore {
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
        let path = self.path_for(key);
        tokio::task::spawn_blocking(move || match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(KvError::from(e)),
        })
        .await?
    }

    async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<(), KvError> {
        KvError::check_size(&value)?;
        let path = self.path_for(key);
        debug!(key = %key, bytes = value.len(), "writing file value");
        tokio::task::spawn_blocking(move || Self::write_atomic(&path, &value)).await?
    }

    async fn delete(&self, key: &KvKey) -> Result<bool, KvError> {
        let path = self.path_for(key);
        tokio::task::spawn_blocking(move || match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(KvError::from(e)),
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn key(name: &str) -> KvKey {
        KvKey::new(KeyNamespace::UserData, name).unwrap()
    }

    #[test]
    fn test_key_validation_empty() {
        let result = KvKey::new(KeyNamespace::Settings, "");
        assert!(matches!(result, Err(KvError::InvalidKey { .. })));
        assert!(KvKey::new(KeyNamespace::Settings, "   ").is_err());
    }

    #[test]
    fn test_key_validation_rejects_unsafe() {
        assert!(KvKey::new(KeyNamespace::Settings, "key\0value").is_err());
        assert!(KvKey::new(KeyNamespace::Settings, "../etc/passwd").is_err());
        assert!(KvKey::new(KeyNamespace::Settings, "/abs").is_err());
        assert!(KvKey::new(KeyNamespace::Settings, "key\x01value").is_err());
        assert!(KvKey::new(KeyNamespace::Settings, "a".repeat(MAX_KEY_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_key_namespace_prefix() {
        let key = KvKey::new(KeyNamespace::Session, "last-viewed.v1").unwrap();
        assert_eq!(key.raw(), "session:last-viewed.v1");
        assert_eq!(key.to_string(), key.raw());
    }

    #[test]
    fn test_error_retryable() {
        assert!(KvError::storage(StorageErrorCode::Busy, "busy").is_retryable());
        assert!(!KvError::storage(StorageErrorCode::Corrupted, "bad").is_retryable());
        assert_eq!(
            KvError::storage(StorageErrorCode::IoError, "x").kind(),
            ErrorKind::Storage
        );
    }

    #[tokio::test]
    async fn memory_roundtrip_and_delete() {
        let store = MemoryKvStore::new();
        assert_eq!(store.get(&key("a")).await.unwrap(), None);

        store.set(&key("a"), b"one".to_vec()).await.unwrap();
        store.set(&key("a"), b"two".to_vec()).await.unwrap();
        assert_eq!(store.get(&key("a")).await.unwrap(), Some(b"two".to_vec()));
        assert_eq!(store.len().await, 1);

        assert!(store.delete(&key("a")).await.unwrap());
        assert!(!store.delete(&key("a")).await.unwrap());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn memory_rejects_oversized_value() {
        let store = MemoryKvStore::new();
        let result = store.set(&key("big"), vec![0u8; MAX_VALUE_SIZE + 1]).await;
        assert!(matches!(result, Err(KvError::ValueTooLarge { .. })));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn namespaces_do_not_collide() {
        let store = MemoryKvStore::new();
        let a = KvKey::new(KeyNamespace::Session, "k").unwrap();
        let b = KvKey::new(KeyNamespace::Settings, "k").unwrap();
        store.set(&a, b"session".to_vec()).await.unwrap();
        assert_eq!(store.get(&b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_roundtrip() {
        let dir = tempdir().unwrap();
        let store = FileKvStore::open(dir.path()).unwrap();

        store.set(&key("quotes.v1"), b"[1,2,3]".to_vec()).await.unwrap();
        let reopened = FileKvStore::open(dir.path()).unwrap();
        assert_eq!(
            reopened.get(&key("quotes.v1")).await.unwrap(),
            Some(b"[1,2,3]".to_vec())
        );
    }

    #[tokio::test]
    async fn file_missing_key_is_none() {
        let dir = tempdir().unwrap();
        let store = FileKvStore::open(dir.path()).unwrap();
        assert_eq!(store.get(&key("nope")).await.unwrap(), None);
        assert!(!store.delete(&key("nope")).await.unwrap());
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_tmp_on_success() {
        let dir = tempdir().unwrap();
        let store = FileKvStore::open(dir.path()).unwrap();
        store.set(&key("snap"), b"{}".to_vec()).await.unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
        assert!(store.delete(&key("snap")).await.unwrap());
    }
}
