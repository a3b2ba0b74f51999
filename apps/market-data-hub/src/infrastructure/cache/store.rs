//! Persistent Store Adapters
//!
//! - [`FileStore`]: one JSON document per key under a directory. Writes go
//!   to a temporary file that is renamed into place, so a crash never leaves
//!   a half-written entry behind.
//! - [`InMemoryStore`]: process-local map, used when no directory is
//!   configured and in tests.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::application::ports::{PersistedEntry, PersistentStore, StoreError, StoreFootprint};

const EXTENSION: &str = "json";

// =============================================================================
// Key Encoding
// =============================================================================

/// Encode a cache key as a file stem.
///
/// ASCII alphanumerics, `-` and `_` pass through; every other byte becomes
/// `%XX`. The mapping is reversible by [`decode_key`].
#[must_use]
pub fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}

/// Decode a file stem produced by [`encode_key`].
#[must_use]
pub fn decode_key(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = stem.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

// =============================================================================
// File Store
// =============================================================================

/// Directory-backed persistent store.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// Root directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey("key cannot be empty".to_string()));
        }
        Ok(self.dir.join(format!("{}.{EXTENSION}", encode_key(key))))
    }

    async fn entry_files(&self) -> Result<Vec<(String, PathBuf)>, StoreError> {
        let mut files = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(key) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(decode_key)
            else {
                continue;
            };
            files.push((key, path));
        }
        Ok(files)
    }
}

#[async_trait]
impl PersistentStore for FileStore {
    async fn load(&self, key: &str) -> Result<Option<PersistedEntry>, StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, key: &str, entry: &PersistedEntry) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let bytes = serde_json::to_vec(entry)?;

        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", encode_key(key), uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self) -> Result<(), StoreError> {
        for (_, path) in self.entry_files().await? {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .entry_files()
            .await?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    async fn footprint(&self) -> Result<StoreFootprint, StoreError> {
        let mut footprint = StoreFootprint::default();
        for (_, path) in self.entry_files().await? {
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                footprint.entries += 1;
                footprint.bytes += meta.len();
            }
        }
        Ok(footprint)
    }
}

// =============================================================================
// In-Memory Store
// =============================================================================

/// Process-local persistent store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: RwLock<HashMap<String, PersistedEntry>>,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl PersistentStore for InMemoryStore {
    async fn load(&self, key: &str) -> Result<Option<PersistedEntry>, StoreError> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn save(&self, key: &str, entry: &PersistedEntry) -> Result<(), StoreError> {
        self.entries.write().insert(key.to_string(), entry.clone());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.write().remove(key).is_some())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.entries.write().clear();
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.entries.read().keys().cloned().collect())
    }

    async fn footprint(&self) -> Result<StoreFootprint, StoreError> {
        let entries = self.entries.read();
        let bytes = entries
            .iter()
            .map(|(key, entry)| {
                key.len() + serde_json::to_vec(entry).map_or(0, |bytes| bytes.len())
            })
            .sum::<usize>();
        Ok(StoreFootprint {
            entries: entries.len(),
            bytes: bytes as u64,
        })
    }
}
