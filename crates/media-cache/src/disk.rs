//! On-disk tier
//!
//! One file per key, named by the SHA-256 of the key plus the key's
//! extension. The file's modification time is the entry's expiry date, so
//! no sidecar metadata is needed. Reads refresh the access time instead.
//!
//! The backend holds no lock of its own. Concurrent writers to the same key
//! race on the same file, and callers that share an instance across threads
//! are responsible for serializing access to it (see `Warehouse`).

use crate::backend::{Backend, DiskTier};
use crate::clock::{self, Clock};
use crate::error::{CacheError, Result};
use crate::fs::{FileSystem, LocalFileSystem};
use crate::serializer::Serializer;
use crate::types::{CacheEntry, DiskConfig, Expiry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Fixed subfolder under the container that holds the entry files
const OBJECTS_FOLDER: &str = "objects";

/// Longest file extension carried over from a key
const MAX_EXTENSION_LEN: usize = 8;

/// Where on disk a cache container lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskLocation {
    pub caches_dir: PathBuf,
    pub app_identifier: String,
}

impl DiskLocation {
    pub fn new(caches_dir: impl Into<PathBuf>, app_identifier: impl Into<String>) -> Self {
        Self {
            caches_dir: caches_dir.into(),
            app_identifier: app_identifier.into(),
        }
    }

    pub fn platform_default(app_identifier: impl Into<String>) -> Self {
        Self::new(platform_cache_dir(), app_identifier)
    }

    pub fn container_path(&self, container_name: &str) -> PathBuf {
        self.caches_dir
            .join(&self.app_identifier)
            .join(container_name)
            .join(OBJECTS_FOLDER)
    }
}

/// `$XDG_CACHE_HOME`, then `$HOME/.cache`, then the temp directory
pub fn platform_cache_dir() -> PathBuf {
    std::env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache")))
        .unwrap_or_else(std::env::temp_dir)
}

/// File name for a key: hex SHA-256 plus the key's extension, if any
pub fn file_name_for_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let hash = hex::encode(hasher.finalize());

    match key_extension(key) {
        Some(ext) => format!("{}.{}", hash, ext),
        None => hash,
    }
}

fn key_extension(key: &str) -> Option<&str> {
    let last_segment = key.rsplit('/').next()?;
    let (stem, ext) = last_segment.rsplit_once('.')?;
    if stem.is_empty()
        || ext.is_empty()
        || ext.len() > MAX_EXTENSION_LEN
        || !ext.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return None;
    }
    Some(ext)
}

/// A stamped modification time that equals the `Never` date reads back as `Never`
fn expiry_from_mtime(date: DateTime<Utc>) -> Expiry {
    if date == Expiry::Never.date() {
        Expiry::Never
    } else {
        Expiry::At(date)
    }
}

#[derive(Debug)]
struct CacheFile {
    path: PathBuf,
    len: u64,
    modified: DateTime<Utc>,
}

struct DiskInner<T, F> {
    config: DiskConfig,
    path: PathBuf,
    serializer: Arc<dyn Serializer<T>>,
    fs: F,
    clock: Arc<dyn Clock>,
}

/// File-per-key cache tier with a byte budget
pub struct DiskBackend<T, F = LocalFileSystem> {
    inner: Arc<DiskInner<T, F>>,
}

impl<T, F> Clone for DiskBackend<T, F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> DiskBackend<T, LocalFileSystem>
where
    T: Send + 'static,
{
    pub fn new(
        config: DiskConfig,
        location: &DiskLocation,
        serializer: Arc<dyn Serializer<T>>,
    ) -> Self {
        Self::with_file_system(config, location, serializer, LocalFileSystem, clock::system())
    }
}

impl<T, F> DiskBackend<T, F>
where
    T: Send + 'static,
    F: FileSystem,
{
    /// Directory creation and protection failures are logged; the backend
    /// retries creating the directory on the next write.
    pub fn with_file_system(
        config: DiskConfig,
        location: &DiskLocation,
        serializer: Arc<dyn Serializer<T>>,
        fs: F,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let path = location.container_path(&config.container_name);

        match fs.create_dir_all(&path) {
            Ok(()) => {
                if let Some(protection) = config.protection {
                    if let Err(e) = fs.set_permissions(&path, protection.mode()) {
                        warn!(path = ?path, error = %e, "Failed to apply cache folder protection");
                    }
                }
            }
            Err(e) => warn!(path = ?path, error = %e, "Failed to create cache folder"),
        }

        info!(
            path = ?path,
            max_size_bytes = config.max_size_bytes,
            "Disk cache initialized"
        );

        Self {
            inner: Arc::new(DiskInner {
                config,
                path,
                serializer,
                fs,
                clock,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn config(&self) -> &DiskConfig {
        &self.inner.config
    }

    pub fn file_path(&self, key: &str) -> PathBuf {
        self.inner.path.join(file_name_for_key(key))
    }

    /// Read an entry. A file whose expiry date is strictly before now is
    /// deleted and reported as missing.
    pub fn load(&self, key: &str) -> Result<CacheEntry<T>> {
        let inner = &self.inner;
        let path = self.file_path(key);

        let data = inner.fs.read(&path)?;
        let info = inner.fs.metadata(&path)?;
        let modified: DateTime<Utc> = info
            .modified
            .ok_or_else(|| CacheError::MalformedAttributes(path.clone()))?
            .into();

        let now = inner.clock.now();
        if now > modified {
            debug!(key = %key, expired_at = %modified, "Disk entry expired");
            self.delete_path(&path);
            return Err(CacheError::NotFound);
        }

        let value = inner.serializer.from_bytes(&data)?;

        if let Err(e) = inner.fs.set_accessed(&path, SystemTime::from(now)) {
            warn!(path = ?path, error = %e, "Failed to refresh access time");
        }

        Ok(CacheEntry {
            value,
            expiry: expiry_from_mtime(modified),
            disk_path: Some(path),
        })
    }

    /// Write an entry and stamp its expiry date as the modification time
    pub fn store(&self, key: &str, value: &T, expiry: Option<Expiry>) -> Result<()> {
        let inner = &self.inner;
        let data = inner.serializer.to_bytes(value)?;
        let expiry = expiry.unwrap_or(inner.config.default_expiry);

        inner.fs.create_dir_all(&inner.path)?;
        let path = self.file_path(key);
        inner.fs.write(&path, &data)?;
        inner.fs.set_modified(&path, SystemTime::from(expiry.date()))?;

        debug!(key = %key, size = data.len(), expiry = %expiry.date(), "Stored disk entry");
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        Ok(self.remove_if_present(&self.file_path(key))?)
    }

    /// Files already gone when their turn comes are skipped
    pub fn delete_all(&self) -> Result<()> {
        let files = self.cache_files()?;
        let count = files.len();
        for file in files {
            self.remove_if_present(&file.path)?;
        }
        debug!(removed = count, path = ?self.inner.path, "Cleared disk cache");
        Ok(())
    }

    /// Delete the key's file if its expiry date is strictly before now
    pub fn delete_if_expired(&self, key: &str) -> Result<()> {
        let path = self.file_path(key);
        let info = match self.inner.fs.metadata(&path) {
            Ok(info) => info,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let modified: DateTime<Utc> = info
            .modified
            .ok_or_else(|| CacheError::MalformedAttributes(path.clone()))?
            .into();

        if self.inner.clock.now() > modified {
            self.delete_path(&path);
        }
        Ok(())
    }

    /// Combined expiry and capacity pass.
    ///
    /// Files whose expiry date is before `base` are deleted. If the rest
    /// still exceed the byte budget, files are evicted until the total is at
    /// most half the budget. Eviction walks the files newest expiry first.
    pub fn purge(&self, base: DateTime<Utc>) -> Result<()> {
        let files = self.cache_files()?;

        let mut live = Vec::with_capacity(files.len());
        let mut live_size = 0u64;
        let mut expired = 0usize;
        for file in files {
            if file.modified < base {
                if self.delete_path(&file.path) {
                    expired += 1;
                }
            } else {
                live_size += file.len;
                live.push(file);
            }
        }

        let max_size = self.inner.config.max_size_bytes;
        let mut evicted = 0usize;
        if max_size > 0 && live_size > max_size {
            let target = max_size / 2;
            // TODO: eviction walks newest expiry first; switch to oldest first
            // once existing caches no longer depend on this order
            live.sort_by(|a, b| b.modified.cmp(&a.modified));

            for file in live {
                if live_size <= target {
                    break;
                }
                if self.delete_path(&file.path) {
                    live_size = live_size.saturating_sub(file.len);
                    evicted += 1;
                }
            }
        }

        if expired > 0 || evicted > 0 {
            info!(expired, evicted, remaining_bytes = live_size, "Purged disk cache");
        }
        Ok(())
    }

    /// Total bytes of the entry files
    pub fn total_size(&self) -> Result<u64> {
        Ok(self.cache_files()?.iter().map(|file| file.len).sum())
    }

    /// `None` when the folder cannot be measured
    pub fn disk_usage(&self) -> Option<u64> {
        match self.total_size() {
            Ok(size) => Some(size),
            Err(e) => {
                warn!(path = ?self.inner.path, error = %e, "Failed to compute disk usage");
                None
            }
        }
    }

    fn remove_if_present(&self, path: &Path) -> io::Result<()> {
        match self.inner.fs.remove_file(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            result => result,
        }
    }

    /// `false` when the file is still there afterwards
    fn delete_path(&self, path: &Path) -> bool {
        match self.remove_if_present(path) {
            Ok(()) => true,
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to delete cache file");
                false
            }
        }
    }

    fn cache_files(&self) -> Result<Vec<CacheFile>> {
        let inner = &self.inner;
        if !inner.fs.exists(&inner.path) {
            return Ok(Vec::new());
        }

        let paths = inner
            .fs
            .list_dir(&inner.path)
            .map_err(|e| CacheError::DirectoryEnumerationFailed(inner.path.clone(), Box::new(e)))?;

        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let info = match inner.fs.metadata(&path) {
                Ok(info) => info,
                Err(e) => {
                    warn!(path = ?path, error = %e, "Failed to read cache file attributes");
                    continue;
                }
            };
            if info.is_dir {
                continue;
            }
            let Some(modified) = info.modified else {
                warn!(path = ?path, "Cache file has no modification time");
                continue;
            };
            files.push(CacheFile {
                path,
                len: info.len,
                modified: modified.into(),
            });
        }
        Ok(files)
    }

    async fn blocking<R, G>(&self, op: G) -> Result<R>
    where
        R: Send + 'static,
        G: FnOnce(&Self) -> Result<R> + Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || op(&this))
            .await
            .map_err(|e| CacheError::Io(Box::new(io::Error::other(e))))?
    }
}

#[async_trait]
impl<T, F> Backend<T> for DiskBackend<T, F>
where
    T: Send + 'static,
    F: FileSystem,
{
    async fn get(&self, key: &str) -> Result<CacheEntry<T>> {
        let key = key.to_string();
        self.blocking(move |disk| disk.load(&key)).await
    }

    async fn set(&self, key: &str, value: T, expiry: Option<Expiry>) -> Result<()> {
        let key = key.to_string();
        self.blocking(move |disk| disk.store(&key, &value, expiry))
            .await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.blocking(move |disk| disk.delete(&key)).await
    }

    async fn remove_all(&self) -> Result<()> {
        self.blocking(|disk| disk.delete_all()).await
    }

    async fn remove_expired(&self) -> Result<()> {
        let now = self.inner.clock.now();
        self.blocking(move |disk| disk.purge(now)).await
    }

    async fn remove_since(&self, date: DateTime<Utc>) -> Result<()> {
        self.blocking(move |disk| disk.purge(date)).await
    }

    async fn remove_if_expired(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.blocking(move |disk| disk.delete_if_expired(&key)).await
    }
}

#[async_trait]
impl<T, F> DiskTier<T> for DiskBackend<T, F>
where
    T: Send + 'static,
    F: FileSystem,
{
    fn disk_capacity(&self) -> u64 {
        self.inner.config.max_size_bytes
    }

    async fn current_disk_usage(&self) -> Option<u64> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.disk_usage())
            .await
            .ok()
            .flatten()
    }
}
