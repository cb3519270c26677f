//! Durable mirror of the in-memory session.
//!
//! Writes are synchronous and happen under the session lock; `FileStore` is
//! sized for a single small CLI profile, not for a busy async server.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use crate::error::StorageError;

/// The four entries a session is persisted as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKey {
    AccessToken,
    RefreshToken,
    Role,
    SubjectId,
}

impl StorageKey {
    pub const ALL: [StorageKey; 4] = [
        StorageKey::AccessToken,
        StorageKey::RefreshToken,
        StorageKey::Role,
        StorageKey::SubjectId,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StorageKey::AccessToken => "accessToken",
            StorageKey::RefreshToken => "refreshToken",
            StorageKey::Role => "userRole",
            StorageKey::SubjectId => "uniqueId",
        }
    }
}

/// String key/value storage scoped to one client profile.
pub trait SessionStore: Send + Sync {
    fn get(&self, key: StorageKey) -> Option<String>;
    fn set(&self, key: StorageKey, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: StorageKey) -> Result<(), StorageError>;
}

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl SessionStore for MemoryStore {
    fn get(&self, key: StorageKey) -> Option<String> {
        self.entries.lock().get(key.as_str()).cloned()
    }

    fn set(&self, key: StorageKey, value: &str) -> Result<(), StorageError> {
        self.entries
            .lock()
            .insert(key.as_str().to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: StorageKey) -> Result<(), StorageError> {
        self.entries.lock().remove(key.as_str());
        Ok(())
    }
}

/// JSON-object file on disk, rewritten in full on every mutation.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open the store at `path`. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let entries = match fs::read(&path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StorageError::Format {
                path: path.display().to_string(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => {
                return Err(StorageError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), StorageError> {
        let io_err = |source| StorageError::Io {
            path: self.path.display().to_string(),
            source,
        };

        if entries.is_empty() {
            return match fs::remove_file(&self.path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(io_err(e)),
                _ => Ok(()),
            };
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let body = serde_json::to_vec_pretty(entries).map_err(|source| StorageError::Format {
            path: self.path.display().to_string(),
            source,
        })?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, body).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)
    }
}

impl SessionStore for FileStore {
    fn get(&self, key: StorageKey) -> Option<String> {
        self.entries.lock().get(key.as_str()).cloned()
    }

    fn set(&self, key: StorageKey, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock();
        entries.insert(key.as_str().to_string(), value.to_string());
        self.persist(&entries)
    }

    fn remove(&self, key: StorageKey) -> Result<(), StorageError> {
        let mut entries = self.entries.lock();
        if entries.remove(key.as_str()).is_none() {
            return Ok(());
        }
        self.persist(&entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_set_get_remove() {
        let store = MemoryStore::new();
        assert_eq!(store.get(StorageKey::AccessToken), None);
        store.set(StorageKey::AccessToken, "A1").unwrap();
        assert_eq!(store.get(StorageKey::AccessToken).as_deref(), Some("A1"));
        store.remove(StorageKey::AccessToken).unwrap();
        store.remove(StorageKey::AccessToken).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile").join("session.json");

        let store = FileStore::open(&path).unwrap();
        store.set(StorageKey::RefreshToken, "R1").unwrap();
        store.set(StorageKey::Role, "admin").unwrap();

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.get(StorageKey::RefreshToken).as_deref(), Some("R1"));
        assert_eq!(reopened.get(StorageKey::Role).as_deref(), Some("admin"));

        let raw: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["userRole"], "admin");
    }

    #[test]
    fn file_store_deletes_file_when_emptied() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let store = FileStore::open(&path).unwrap();
        store.set(StorageKey::SubjectId, "U1").unwrap();
        assert!(path.exists());
        store.remove(StorageKey::SubjectId).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn file_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(
            FileStore::open(&path),
            Err(StorageError::Format { .. })
        ));
    }
}
