use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

pub const KEY_CURRENT_USER: &str = "nova_current_user";
pub const KEY_PERSONAL_HISTORY: &str = "nova_personal_history";
pub const KEY_SHARED_HISTORY: &str = "nova_shared_history";
pub const KEY_FACTS: &str = "nova_facts";
pub const KEY_LAST_SYNC: &str = "nova_last_sync";
pub const KEY_PENDING_SYNC: &str = "nova_pending_sync";

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("invalid state key: {0}")]
    InvalidKey(String),
    #[error("state store i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("state blob is not valid json: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Keyed scalar blobs read at startup and rewritten after every mutation.
pub trait LocalStateStore: Send + Sync {
    fn load_raw(&self, key: &str) -> Result<Option<String>, StateStoreError>;
    fn store_raw(&self, key: &str, value: &str) -> Result<(), StateStoreError>;
    fn remove(&self, key: &str) -> Result<(), StateStoreError>;
}

impl dyn LocalStateStore {
    pub fn load_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StateStoreError> {
        match self.load_raw(key)? {
            Some(raw) if !raw.trim().is_empty() => Ok(Some(serde_json::from_str(&raw)?)),
            _ => Ok(None),
        }
    }

    pub fn store_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), StateStoreError> {
        let raw = serde_json::to_string(value)?;
        self.store_raw(key, &raw)
    }
}

pub struct FileStateStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StateStoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StateStoreError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
        if !valid {
            return Err(StateStoreError::InvalidKey(key.to_string()));
        }

        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl LocalStateStore for FileStateStore {
    fn load_raw(&self, key: &str) -> Result<Option<String>, StateStoreError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(path) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn store_raw(&self, key: &str, value: &str) -> Result<(), StateStoreError> {
        let path = self.path_for(key)?;
        let tmp_path = path.with_extension("json.tmp");
        let _guard = match self.write_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut file = File::create(&tmp_path)?;
        file.write_all(value.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StateStoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Default)]
pub struct InMemoryStateStore {
    blobs: Mutex<HashMap<String, String>>,
}

impl InMemoryStateStore {
    fn lock_blobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        match self.blobs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl LocalStateStore for InMemoryStateStore {
    fn load_raw(&self, key: &str) -> Result<Option<String>, StateStoreError> {
        Ok(self.lock_blobs().get(key).cloned())
    }

    fn store_raw(&self, key: &str, value: &str) -> Result<(), StateStoreError> {
        self.lock_blobs().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StateStoreError> {
        self.lock_blobs().remove(key);
        Ok(())
    }
}
