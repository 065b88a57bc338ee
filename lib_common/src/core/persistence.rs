//! # Debounced Document Persistence
//!
//! The live list and the discussion log are each held in memory as a
//! [`Document`]: an ordered JSON array bound to one key of a [`BlobStore`].
//! Mutations only set a dirty flag; the hub calls [`Document::maybe_save`] on a
//! fixed interval so a burst of edits costs a single write.
//!
//! When the list fills up, [`Document::rollover`] archives the current file
//! under the next free name of a numbered pattern (`data/storyNNN.json` →
//! `data/story000.json`, `data/story001.json`, …) and starts over empty.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("archive pattern {0:?} has no 'N' placeholder run")]
    Pattern(String),

    #[error("every archive name for {0:?} is taken")]
    ArchivesExhausted(String),
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Durable key → bytes storage.
pub trait BlobStore: Send + Sync {
    fn exists(&self, key: &Path) -> bool;
    fn read(&self, key: &Path) -> Result<Option<Vec<u8>>, StoreError>;
    fn write(&self, key: &Path, bytes: &[u8]) -> Result<(), StoreError>;
    fn rename(&self, from: &Path, to: &Path) -> Result<(), StoreError>;
}

/// [`BlobStore`] over the local file system. Keys are paths.
#[derive(Debug, Default, Clone)]
pub struct FsStore;

impl BlobStore for FsStore {
    fn exists(&self, key: &Path) -> bool {
        key.exists()
    }

    fn read(&self, key: &Path) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(key) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(key, e)),
        }
    }

    fn write(&self, key: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = key.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        fs::write(key, bytes).map_err(|e| StoreError::io(key, e))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), StoreError> {
        fs::rename(from, to).map_err(|e| StoreError::io(from, e))
    }
}

/// In-memory [`BlobStore`]; clones share the same map.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    blobs: Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn blobs(&self) -> MutexGuard<'_, HashMap<PathBuf, Vec<u8>>> {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sorted list of stored keys.
    pub fn keys(&self) -> Vec<PathBuf> {
        let blobs = self.blobs();
        let mut keys: Vec<PathBuf> = blobs.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn get(&self, key: &Path) -> Option<Vec<u8>> {
        self.blobs().get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<PathBuf>, bytes: Vec<u8>) {
        self.blobs().insert(key.into(), bytes);
    }
}

impl BlobStore for MemoryStore {
    fn exists(&self, key: &Path) -> bool {
        self.blobs().contains_key(key)
    }

    fn read(&self, key: &Path) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.get(key))
    }

    fn write(&self, key: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        self.insert(key, bytes.to_vec());
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), StoreError> {
        let mut blobs = self.blobs();
        match blobs.remove(from) {
            Some(bytes) => {
                blobs.insert(to.to_path_buf(), bytes);
                Ok(())
            }
            None => Err(StoreError::io(from, io::ErrorKind::NotFound.into())),
        }
    }
}

/// Resolves the first unused archive name for `pattern`.
///
/// The first run of `N` characters is replaced by a zero-padded index of the
/// same width; indices are tried from 0 upward until a name does not exist.
pub fn archive_name(store: &dyn BlobStore, pattern: &str) -> Result<PathBuf, StoreError> {
    let start = pattern.find('N').ok_or_else(|| StoreError::Pattern(pattern.to_string()))?;
    let width = pattern[start..].chars().take_while(|c| *c == 'N').count();
    let (head, tail) = (&pattern[..start], &pattern[start + width..]);

    // past this the index would no longer fit the placeholder width
    let limit = u32::try_from(width).ok().and_then(|w| 10u64.checked_pow(w));
    let mut number: u64 = 0;
    while limit.map_or(true, |limit| number < limit) {
        let candidate = PathBuf::from(format!("{head}{number:0width$}{tail}"));
        debug!("Trying filename {:?}...", candidate);
        if !store.exists(&candidate) {
            return Ok(candidate);
        }
        number += 1;
    }
    warn!("No free archive name left for {}", pattern);
    Err(StoreError::ArchivesExhausted(pattern.to_string()))
}

/// An ordered, dirty-tracked array of records persisted as JSON under one key.
pub struct Document<T> {
    key: PathBuf,
    items: Vec<T>,
    dirty: bool,
    store: Arc<dyn BlobStore>,
}

impl<T: Serialize + DeserializeOwned> Document<T> {
    /// Loads `key` from the store. Missing, unreadable or corrupt content yields an empty document.
    pub fn load(store: Arc<dyn BlobStore>, key: impl Into<PathBuf>) -> Self {
        let key = key.into();
        let items = match store.read(&key) {
            Ok(Some(bytes)) => match serde_json::from_slice::<Vec<T>>(&bytes) {
                Ok(items) => items,
                Err(e) => {
                    warn!("Ignoring corrupt document {}: {}", key.display(), e);
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Failed to read document {}: {}", key.display(), e);
                Vec::new()
            }
        };
        info!("Loaded {} records from {}", items.len(), key.display());
        Self {
            key,
            items,
            dirty: false,
            store,
        }
    }

    pub fn key(&self) -> &Path {
        &self.key
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    /// Mutable access; marks the document dirty.
    pub fn items_mut(&mut self) -> &mut Vec<T> {
        self.dirty = true;
        &mut self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn push(&mut self, item: T) {
        self.items_mut().push(item);
    }

    /// Appends and drops the oldest records beyond `max`.
    pub fn push_bounded(&mut self, item: T, max: usize) {
        let items = self.items_mut();
        items.push(item);
        if items.len() > max {
            let excess = items.len() - max;
            items.drain(..excess);
        }
    }

    /// Writes the document if it changed since the last successful write.
    ///
    /// On failure the dirty flag stays set, so the next call retries.
    pub fn maybe_save(&mut self) -> Result<bool, StoreError> {
        if !self.dirty {
            return Ok(false);
        }
        let bytes = serde_json::to_vec(&self.items)?;
        self.store.write(&self.key, &bytes)?;
        info!("Saving {} records to {}.", self.items.len(), self.key.display());
        self.dirty = false;
        Ok(true)
    }

    pub fn force_save(&mut self) -> Result<(), StoreError> {
        self.dirty = true;
        self.maybe_save().map(|_| ())
    }

    /// Archives the current content and resets to empty.
    ///
    /// Order: save under the live key, rename to the next free archive name,
    /// clear, save the empty document. Returns the archive name.
    ///
    /// An error means nothing was archived and the content is untouched. Once
    /// the rename succeeds the rollover has happened: a failed save of the
    /// empty document is only logged and left dirty for the next save.
    pub fn rollover(&mut self, pattern: &str) -> Result<PathBuf, StoreError> {
        self.force_save()?;
        let archive = archive_name(self.store.as_ref(), pattern)?;
        self.store.rename(&self.key, &archive)?;
        info!("Moved {} to {}", self.key.display(), archive.display());
        self.items.clear();
        if let Err(e) = self.force_save() {
            warn!("Failed to save emptied {}: {}. Retrying on next save.", self.key.display(), e);
        }
        Ok(archive)
    }
}

/// A [`MemoryStore`] whose writes can be made to fail.
#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub(crate) struct FailingStore {
    pub(crate) inner: MemoryStore,
    fail_writes: Arc<std::sync::atomic::AtomicBool>,
    fail_empty_writes: Arc<std::sync::atomic::AtomicBool>,
}

#[cfg(test)]
impl FailingStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Every write fails while set.
    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// Writes of an empty array (`[]`) fail while set.
    pub(crate) fn fail_empty_writes(&self, fail: bool) {
        self.fail_empty_writes.store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
impl BlobStore for FailingStore {
    fn exists(&self, key: &Path) -> bool {
        self.inner.exists(key)
    }

    fn read(&self, key: &Path) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.read(key)
    }

    fn write(&self, key: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        use std::sync::atomic::Ordering;
        let empty = bytes == b"[]";
        if self.fail_writes.load(Ordering::SeqCst) || (empty && self.fail_empty_writes.load(Ordering::SeqCst)) {
            return Err(StoreError::io(key, io::ErrorKind::PermissionDenied.into()));
        }
        self.inner.write(key, bytes)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), StoreError> {
        self.inner.rename(from, to)
    }
}
