use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Errors raised by a [`SessionStore`] backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage file is not valid JSON: {0}")]
    Format(#[from] serde_json::Error),
    #[error("storage lock poisoned")]
    Poisoned,
}

/// String key/value storage holding one browser context's session fields.
///
/// Two backends exist: a durable one that outlives the process ([`FileStore`]) and an
/// ephemeral one scoped to the running context ([`MemoryStore`]). Calls may block and
/// may fail, so every method returns a `Result`.
///
/// # Example
///
/// ```rust,ignore
/// impl SessionStore for KeychainStore {
///     fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
///         self.keychain.read(&format!("laptop/{key}")).map_err(StoreError::Io)
///     }
///     // ...
/// }
/// ```
pub trait SessionStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Remove a key. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// In-memory store; contents vanish with the process (like tab-scoped storage).
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every entry, as closing the tab would.
    pub fn clear_all(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().map(|e| e.is_empty()).unwrap_or(true)
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, String>>, StoreError> {
        self.entries.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl SessionStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.lock()?.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.lock()?.remove(key);
        Ok(())
    }
}

/// Durable store backed by a JSON object on disk.
///
/// Every write rewrites the whole file through a sibling temp file and a rename, so a
/// crash mid-write leaves the previous contents intact. A file that is not a JSON
/// object reads as empty and is replaced by the next `set` or `remove`.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>, StoreError> {
        match std::fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    // Unparseable contents read as empty; the flag tells writers to overwrite them.
    fn load_or_reset(&self) -> Result<(BTreeMap<String, String>, bool), StoreError> {
        match self.load() {
            Ok(entries) => Ok((entries, false)),
            Err(StoreError::Format(e)) => {
                tracing::warn!(error = %e, path = %self.path.display(), "Discarding unreadable session file");
                Ok((BTreeMap::new(), true))
            }
            Err(e) => Err(e),
        }
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn modify(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, String>) -> bool,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        let (mut entries, corrupt) = self.load_or_reset()?;
        if f(&mut entries) || corrupt {
            self.persist(&entries)?;
        }
        Ok(())
    }
}

impl SessionStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.load_or_reset()?.0.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.modify(|entries| {
            entries.insert(key.to_owned(), value.to_owned()).as_deref() != Some(value)
        })
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.modify(|entries| entries.remove(key).is_some())
    }
}
