//! Two-tier image cache
//!
//! Decoded images live in a cost-bounded memory tier; encoded bytes live in
//! one folder on disk. Memory operations run on the caller's task. Every
//! disk operation goes through a single serial queue, and completion
//! callbacks run on a dedicated callback task, never inline.
//!
//! Disk recency is the file modification time: reads and memory hits stamp
//! it with the current time.

use crate::clock::{self, Clock};
use crate::config::ImageCacheConfig;
use crate::disk::file_name_for_key;
use crate::error::{CacheError, Result};
use crate::fs::{FileSystem, LocalFileSystem};
use crate::image::PixelCost;
use crate::memory::BoundedMemoryBackend;
use crate::serializer::Serializer;
use crate::signal::{MemoryPressure, Subscription};
use crate::types::{BoundedMemoryConfig, CachePolicy, CacheStats, Expiry};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::SystemTime;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// A purge brings disk usage down to this share of the capacity
const DISK_LOW_WATER_PERCENT: u64 = 80;

type DiskJob = Box<dyn FnOnce(&mut DiskLedger) + Send>;
type Callback = Box<dyn FnOnce() + Send>;

/// Disk bookkeeping owned by the disk queue
#[derive(Debug, Default)]
struct DiskLedger {
    used: u64,
    /// `used` is meaningless until the folder has been measured
    measured: bool,
}

impl DiskLedger {
    fn usage(&self) -> Option<u64> {
        self.measured.then_some(self.used)
    }
}

struct Shared<V> {
    directory: PathBuf,
    policy: RwLock<CachePolicy>,
    memory: RwLock<BoundedMemoryBackend<V>>,
    max_memory_cost: AtomicU64,
    max_disk_capacity: AtomicU64,
    codec: Arc<dyn Serializer<V>>,
    fs: Arc<dyn FileSystem>,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
}

fn memory_tier<V>(max_memory_cost: u64, clock: &Arc<dyn Clock>) -> BoundedMemoryBackend<V>
where
    V: Clone + Send + Sync + 'static,
{
    let config = BoundedMemoryConfig {
        total_cost_limit: max_memory_cost,
        ..Default::default()
    };
    BoundedMemoryBackend::with_clock(config, clock.clone())
}

impl<V> Shared<V>
where
    V: PixelCost + Clone + Send + Sync + 'static,
{
    fn policy(&self) -> CachePolicy {
        *self.policy.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn memory(&self) -> BoundedMemoryBackend<V> {
        self.memory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.directory.join(file_name_for_key(key))
    }

    fn memorize(&self, key: &str, value: V, cost: u64) {
        if self.policy().includes_memory() {
            self.memory().insert(key, value, Some(Expiry::Never), cost);
        }
    }

    fn clear_memory(&self) {
        self.memory().clear();
    }

    fn touch(&self, path: &Path) {
        let now = SystemTime::from(self.clock.now());
        match self.fs.set_modified(path, now) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = ?path, "No disk copy to touch");
            }
            Err(e) => warn!(path = ?path, error = %e, "Failed to update cached file modified date"),
        }
    }

    fn read_disk(&self, key: &str) -> Option<V> {
        let path = self.file_path(key);
        self.touch(&path);

        let data = match self.fs.read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read cached image");
                return None;
            }
        };

        match self.codec.from_bytes(&data) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to decode cached image");
                None
            }
        }
    }

    fn write_disk(&self, ledger: &mut DiskLedger, key: &str, data: &[u8]) {
        if !self.fs.exists(&self.directory) {
            if let Err(e) = self.fs.create_dir_all(&self.directory) {
                warn!(path = ?self.directory, error = %e, "Failed to create image cache directory");
            }
        }

        let path = self.file_path(key);
        let replaced = self.fs.metadata(&path).map(|info| info.len).unwrap_or(0);

        if let Err(e) = self.fs.write(&path, data) {
            warn!(key = %key, error = %e, "Failed to write cached image");
            return;
        }

        if ledger.measured {
            ledger.used = ledger.used.saturating_sub(replaced) + data.len() as u64;
        }
        debug!(key = %key, size = data.len(), used = ?ledger.usage(), "Cached image on disk");
        self.purge_to_capacity(ledger);
    }

    fn delete_file(&self, ledger: &mut DiskLedger, path: &Path) {
        let len = match self.fs.metadata(path) {
            Ok(info) => info.len,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to read cached file attributes");
                return;
            }
        };

        match self.fs.remove_file(path) {
            Ok(()) => ledger.used = ledger.used.saturating_sub(len),
            Err(e) => warn!(path = ?path, error = %e, "Failed to remove cached file"),
        }
    }

    /// Runs once usage reaches the capacity and evicts until usage is at
    /// most 80% of it, newest modification time first
    fn purge_to_capacity(&self, ledger: &mut DiskLedger) {
        if !ledger.measured {
            self.remeasure(ledger);
            if !ledger.measured {
                return;
            }
        }
        let max = self.max_disk_capacity.load(Ordering::Relaxed);
        if ledger.used < max {
            return;
        }
        let target = max.saturating_mul(DISK_LOW_WATER_PERCENT) / 100;

        let files = match self.files_newest_first() {
            Ok(files) => files,
            Err(e) => {
                warn!(path = ?self.directory, error = %e, "Failed listing image cache directory");
                return;
            }
        };

        let before = ledger.used;
        let mut removed = 0usize;
        for path in files {
            self.delete_file(ledger, &path);
            removed += 1;
            if ledger.used <= target {
                break;
            }
        }
        info!(removed, before, after = ledger.used, max, "Purged image cache directory");
    }

    fn files_newest_first(&self) -> io::Result<Vec<PathBuf>> {
        let mut files: Vec<(PathBuf, SystemTime)> = Vec::new();
        for path in self.fs.list_dir(&self.directory)? {
            let Ok(info) = self.fs.metadata(&path) else {
                continue;
            };
            if info.is_dir {
                continue;
            }
            files.push((path, info.modified.unwrap_or(SystemTime::UNIX_EPOCH)));
        }
        // TODO: eviction walks newest first like the disk backend; switch to
        // oldest first together with it
        files.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(files.into_iter().map(|(path, _)| path).collect())
    }

    fn remeasure(&self, ledger: &mut DiskLedger) {
        match self.measure_disk() {
            Some(used) => {
                ledger.used = used;
                ledger.measured = true;
            }
            None => ledger.measured = false,
        }
    }

    /// `None` when the folder cannot be listed
    fn measure_disk(&self) -> Option<u64> {
        let paths = match self.fs.list_dir(&self.directory) {
            Ok(paths) => paths,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Some(0),
            Err(e) => {
                warn!(path = ?self.directory, error = %e, "Failed listing image cache directory");
                return None;
            }
        };

        let used = paths
            .iter()
            .filter_map(|path| match self.fs.metadata(path) {
                Ok(info) if !info.is_dir => Some(info.len),
                Ok(_) => None,
                Err(e) => {
                    warn!(path = ?path, error = %e, "Failed to read cached file attributes");
                    None
                }
            })
            .sum();
        Some(used)
    }
}

async fn run_disk_queue(mut jobs: mpsc::UnboundedReceiver<DiskJob>) {
    let ledger = Arc::new(Mutex::new(DiskLedger::default()));
    while let Some(job) = jobs.recv().await {
        let ledger = ledger.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut ledger = ledger.lock().unwrap_or_else(PoisonError::into_inner);
            job(&mut ledger);
        })
        .await;
        if let Err(e) = result {
            error!(error = %e, "Image cache disk job failed");
        }
    }
    debug!("Image cache disk queue closed");
}

async fn run_callbacks(mut callbacks: mpsc::UnboundedReceiver<Callback>) {
    while let Some(callback) = callbacks.recv().await {
        callback();
    }
}

/// Image cache over a memory tier and a disk folder.
///
/// Must be created inside a Tokio runtime. Dropping the cache lets queued
/// disk work finish and unsubscribes from memory pressure.
pub struct ImageCache<V> {
    shared: Arc<Shared<V>>,
    disk_queue: mpsc::UnboundedSender<DiskJob>,
    callbacks: mpsc::UnboundedSender<Callback>,
    subscription: Mutex<Option<Subscription>>,
}

impl<V> ImageCache<V>
where
    V: PixelCost + Clone + Send + Sync + 'static,
{
    pub fn new(config: ImageCacheConfig, codec: Arc<dyn Serializer<V>>) -> Result<Self> {
        Self::with_parts(config, codec, Arc::new(LocalFileSystem), clock::system())
    }

    pub fn with_parts(
        config: ImageCacheConfig,
        codec: Arc<dyn Serializer<V>>,
        fs: Arc<dyn FileSystem>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| CacheError::Config(format!("Image cache needs a Tokio runtime: {}", e)))?;

        let directory = config.directory();
        let shared = Arc::new(Shared {
            directory: directory.clone(),
            policy: RwLock::new(config.policy),
            memory: RwLock::new(memory_tier(config.max_memory_cost, &clock)),
            max_memory_cost: AtomicU64::new(config.max_memory_cost),
            max_disk_capacity: AtomicU64::new(config.max_disk_capacity),
            codec,
            fs,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        });

        let (disk_queue, disk_jobs) = mpsc::unbounded_channel();
        let (callbacks, callback_rx) = mpsc::unbounded_channel();
        runtime.spawn(run_disk_queue(disk_jobs));
        runtime.spawn(run_callbacks(callback_rx));

        let cache = Self {
            shared,
            disk_queue,
            callbacks,
            subscription: Mutex::new(None),
        };

        let shared = cache.shared.clone();
        cache.enqueue(move |ledger| {
            shared.remeasure(ledger);
            shared.purge_to_capacity(ledger);
        });

        info!(
            name = %config.name,
            directory = ?directory,
            policy = ?config.policy,
            max_disk_capacity = config.max_disk_capacity,
            max_memory_cost = config.max_memory_cost,
            "Image cache initialized"
        );
        Ok(cache)
    }

    fn enqueue<J>(&self, job: J)
    where
        J: FnOnce(&mut DiskLedger) + Send + 'static,
    {
        if self.disk_queue.send(Box::new(job)).is_err() {
            warn!("Image cache disk queue is closed");
        }
    }

    fn complete<C>(&self, callback: C)
    where
        C: FnOnce() + Send + 'static,
    {
        dispatch(&self.callbacks, callback);
    }

    async fn query<R, Q>(&self, query: Q) -> Option<R>
    where
        R: Send + 'static,
        Q: FnOnce(&Shared<V>, &mut DiskLedger) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let shared = self.shared.clone();
        self.enqueue(move |ledger| {
            let _ = tx.send(query(&shared, ledger));
        });
        rx.await.ok()
    }

    /// Look up an image: memory first, then disk when the policy includes it.
    /// A disk hit is copied into memory before `on_complete` runs.
    pub fn get<F>(&self, key: &str, on_complete: F)
    where
        F: FnOnce(Option<V>) + Send + 'static,
    {
        let shared = &self.shared;

        if let Ok(entry) = shared.memory().lookup(key) {
            shared.hits.fetch_add(1, Ordering::Relaxed);

            let path = shared.file_path(key);
            let toucher = shared.clone();
            self.enqueue(move |_| toucher.touch(&path));

            let value = entry.value;
            self.complete(move || on_complete(Some(value)));
            return;
        }

        if !shared.policy().includes_disk() {
            shared.misses.fetch_add(1, Ordering::Relaxed);
            self.complete(move || on_complete(None));
            return;
        }

        let key = key.to_string();
        let shared = shared.clone();
        let callbacks = self.callbacks.clone();
        self.enqueue(move |_| match shared.read_disk(&key) {
            Some(value) => {
                shared.hits.fetch_add(1, Ordering::Relaxed);
                let cost = value.pixel_cost();
                shared.memorize(&key, value.clone(), cost);
                dispatch(&callbacks, move || on_complete(Some(value)));
            }
            None => {
                shared.misses.fetch_add(1, Ordering::Relaxed);
                dispatch(&callbacks, move || on_complete(None));
            }
        });
    }

    /// Cache an image. `raw` is the encoded form to persist; without it the
    /// codec encodes `value`. The memory cost is the length of `raw` when
    /// given, otherwise the image's pixel cost.
    pub fn set<F>(&self, key: &str, value: V, raw: Option<Vec<u8>>, on_complete: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = &self.shared;
        let policy = shared.policy();

        if policy.includes_memory() {
            let cost = raw
                .as_ref()
                .map(|data| data.len() as u64)
                .unwrap_or_else(|| value.pixel_cost());
            shared.memory().insert(key, value.clone(), Some(Expiry::Never), cost);
        }

        if !policy.includes_disk() {
            self.complete(on_complete);
            return;
        }

        let key = key.to_string();
        let shared = shared.clone();
        let callbacks = self.callbacks.clone();
        self.enqueue(move |ledger| {
            let data = match raw {
                Some(data) => Some(data),
                None => match shared.codec.to_bytes(&value) {
                    Ok(data) => Some(data),
                    Err(e) => {
                        warn!(key = %key, error = %e, "Couldn't encode image for disk");
                        None
                    }
                },
            };
            if let Some(data) = data {
                shared.write_disk(ledger, &key, &data);
            }
            dispatch(&callbacks, on_complete);
        });
    }

    /// Drop the memory copy now and the disk copy on the disk queue
    pub fn remove(&self, key: &str) {
        self.shared.memory().invalidate(key);

        let path = self.shared.file_path(key);
        let shared = self.shared.clone();
        self.enqueue(move |ledger| shared.delete_file(ledger, &path));
    }

    /// `get` as a future
    pub async fn load(&self, key: &str) -> Option<V> {
        let (tx, rx) = oneshot::channel();
        self.get(key, move |value| {
            let _ = tx.send(value);
        });
        rx.await.ok().flatten()
    }

    /// `set` as a future that resolves once the disk write was attempted
    pub async fn store(&self, key: &str, value: V, raw: Option<Vec<u8>>) {
        let (tx, rx) = oneshot::channel();
        self.set(key, value, raw, move || {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }

    /// Present in memory, or a file exists for the key
    pub async fn has_cached(&self, key: &str) -> bool {
        if self.shared.memory().contains(key) {
            return true;
        }
        let path = self.shared.file_path(key);
        self.query(move |shared, _| shared.fs.exists(&path))
            .await
            .unwrap_or(false)
    }

    pub fn cost_for(&self, value: &V) -> u64 {
        value.pixel_cost()
    }

    pub fn clear_memory(&self) {
        self.shared.clear_memory();
    }

    /// Bytes on disk as tracked by the disk queue; `None` while the folder
    /// cannot be measured
    pub async fn current_disk_usage(&self) -> Option<u64> {
        self.query(|_, ledger| ledger.usage()).await.flatten()
    }

    pub async fn stats(&self) -> CacheStats {
        let total_size = self.current_disk_usage().await.unwrap_or(0);
        CacheStats {
            entries: self.shared.memory().entry_count() as usize,
            total_size,
            hits: self.shared.hits.load(Ordering::Relaxed),
            misses: self.shared.misses.load(Ordering::Relaxed),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.shared.directory
    }

    pub fn policy(&self) -> CachePolicy {
        self.shared.policy()
    }

    pub fn set_policy(&self, policy: CachePolicy) {
        *self
            .shared
            .policy
            .write()
            .unwrap_or_else(PoisonError::into_inner) = policy;
    }

    pub fn max_disk_capacity(&self) -> u64 {
        self.shared.max_disk_capacity.load(Ordering::Relaxed)
    }

    /// Takes effect immediately with a purge pass on the disk queue
    pub fn set_max_disk_capacity(&self, bytes: u64) {
        self.shared.max_disk_capacity.store(bytes, Ordering::Relaxed);
        let shared = self.shared.clone();
        self.enqueue(move |ledger| shared.purge_to_capacity(ledger));
    }

    pub fn max_memory_cost(&self) -> u64 {
        self.shared.max_memory_cost.load(Ordering::Relaxed)
    }

    /// Replaces the memory tier, so everything held in memory is dropped
    pub fn set_max_memory_cost(&self, bytes: u64) {
        let shared = &self.shared;
        shared.max_memory_cost.store(bytes, Ordering::Relaxed);
        let replacement = memory_tier(bytes, &shared.clock);
        *shared.memory.write().unwrap_or_else(PoisonError::into_inner) = replacement;
    }

    /// Clear the memory tier on every low-memory warning; disk is untouched
    pub fn watch_memory_pressure(&self, signal: &MemoryPressure) {
        let weak = Arc::downgrade(&self.shared);
        let subscription = signal.subscribe(move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(shared) => {
                        shared.clear_memory();
                        info!("Low memory warning, cleared image memory cache");
                        true
                    }
                    None => false,
                }
            }
        });
        *self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(subscription);
    }
}

fn dispatch<C>(callbacks: &mpsc::UnboundedSender<Callback>, callback: C)
where
    C: FnOnce() + Send + 'static,
{
    if callbacks.send(Box::new(callback)).is_err() {
        debug!("Image cache callback context is closed");
    }
}
