//! Bearer token storage
//!
//! The token lives in a named slot of a [`SessionStorage`] and is cached in
//! memory after the first read. Values are trimmed on every read and write;
//! an empty value means "no token".

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Session-scoped key/value storage for credentials
pub trait SessionStorage: Send + Sync {
    /// Read a slot, `None` when it is not set
    fn get(&self, key: &str) -> io::Result<Option<String>>;

    /// Write a slot
    fn set(&self, key: &str, value: &str) -> io::Result<()>;

    /// Remove a slot; removing a missing slot is not an error
    fn remove(&self, key: &str) -> io::Result<()>;
}

/// In-memory storage that lives as long as the process
#[derive(Debug, Default)]
pub struct MemorySessionStorage {
    slots: Mutex<HashMap<String, String>>,
}

impl MemorySessionStorage {
    /// Create empty storage
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStorage for MemorySessionStorage {
    fn get(&self, key: &str) -> io::Result<Option<String>> {
        Ok(self.slots.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> io::Result<()> {
        self.slots.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        self.slots.lock().remove(key);
        Ok(())
    }
}

/// Storage keeping one file per slot inside a directory
///
/// Point it at a per-session directory (for example a temp dir removed on
/// exit) to get session-scoped persistence across client instances.
#[derive(Debug, Clone)]
pub struct FileSessionStorage {
    dir: PathBuf,
}

impl FileSessionStorage {
    /// Use `dir` for slot files; it is created on first write
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the slot files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn slot_path(&self, key: &str) -> io::Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
            && !key.starts_with('.');
        if !valid {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid storage key: {key:?}"),
            ));
        }
        Ok(self.dir.join(key))
    }
}

impl SessionStorage for FileSessionStorage {
    fn get(&self, key: &str) -> io::Result<Option<String>> {
        match fs::read_to_string(self.slot_path(key)?) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn set(&self, key: &str, value: &str) -> io::Result<()> {
        let path = self.slot_path(key)?;
        fs::create_dir_all(&self.dir)?;
        fs::write(path, value)
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        match fs::remove_file(self.slot_path(key)?) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Cached, persisted bearer token
pub struct TokenStore {
    storage: Arc<dyn SessionStorage>,
    key: String,
    // None until the slot has been read once
    cache: Mutex<Option<String>>,
}

impl TokenStore {
    /// Create a store over `storage` using slot `key`
    pub fn new(storage: Arc<dyn SessionStorage>, key: impl Into<String>) -> Self {
        Self {
            storage,
            key: key.into(),
            cache: Mutex::new(None),
        }
    }

    /// Create a store backed by fresh in-memory storage
    pub fn in_memory(key: impl Into<String>) -> Self {
        Self::new(Arc::new(MemorySessionStorage::new()), key)
    }

    /// Current token, `""` when none is stored
    ///
    /// Storage failures are logged and read as an empty token.
    pub fn read(&self) -> String {
        let mut cache = self.cache.lock();
        if let Some(token) = cache.as_ref() {
            return token.clone();
        }

        let token = match self.storage.get(&self.key) {
            Ok(value) => value.map(|v| v.trim().to_string()).unwrap_or_default(),
            Err(e) => {
                warn!("Failed to read token from session storage: {e}");
                String::new()
            }
        };
        *cache = Some(token.clone());
        token
    }

    /// Replace the token; `None` or a blank value clears it
    ///
    /// Storage failures are logged; the new value still takes effect in memory.
    pub fn write(&self, token: Option<&str>) {
        let token = token.map(str::trim).unwrap_or_default().to_string();

        // Held across persist and cache update so writers cannot interleave.
        let mut cache = self.cache.lock();
        let persisted = if token.is_empty() {
            self.storage.remove(&self.key)
        } else {
            self.storage.set(&self.key, &token)
        };
        if let Err(e) = persisted {
            warn!("Failed to persist token to session storage: {e}");
        }
        debug!(present = !token.is_empty(), "Token updated");
        *cache = Some(token);
    }

    /// Forget the token
    pub fn clear(&self) {
        self.write(None);
    }

    /// Whether a non-empty token is available
    pub fn has_token(&self) -> bool {
        !self.read().is_empty()
    }
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("key", &self.key)
            .field("loaded", &self.cache.lock().is_some())
            .finish_non_exhaustive()
    }
}
