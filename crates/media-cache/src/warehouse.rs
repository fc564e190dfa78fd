//! Shared two-tier store with a single access lock
//!
//! The disk tier does no locking of its own, so the warehouse serializes
//! access: reads share the lock and writes hold it exclusively. The backing
//! storage can be swapped for one with new capacities while the warehouse
//! is in use.

use crate::backend::{Backend, DiskTier, MemoryTier};
use crate::disk::{DiskBackend, DiskLocation};
use crate::error::Result;
use crate::hybrid::HybridBackend;
use crate::memory::BoundedMemoryBackend;
use crate::purging::AutoPurgingBackend;
use crate::serializer::Serializer;
use crate::signal::MemoryPressure;
use crate::types::{AutoPurgingConfig, BoundedMemoryConfig, CacheEntry, DiskConfig, Expiry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;
use tracing::info;

/// Memory tier of a warehouse
pub enum MemoryStore<T> {
    Bounded(BoundedMemoryBackend<T>),
    Purging(AutoPurgingBackend<T>),
}

#[async_trait]
impl<T> Backend<T> for MemoryStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<CacheEntry<T>> {
        match self {
            MemoryStore::Bounded(memory) => memory.get(key).await,
            MemoryStore::Purging(memory) => memory.get(key).await,
        }
    }

    async fn set(&self, key: &str, value: T, expiry: Option<Expiry>) -> Result<()> {
        match self {
            MemoryStore::Bounded(memory) => memory.set(key, value, expiry).await,
            MemoryStore::Purging(memory) => memory.set(key, value, expiry).await,
        }
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match self {
            MemoryStore::Bounded(memory) => memory.remove(key).await,
            MemoryStore::Purging(memory) => memory.remove(key).await,
        }
    }

    async fn remove_all(&self) -> Result<()> {
        match self {
            MemoryStore::Bounded(memory) => memory.remove_all().await,
            MemoryStore::Purging(memory) => memory.remove_all().await,
        }
    }

    async fn remove_expired(&self) -> Result<()> {
        match self {
            MemoryStore::Bounded(memory) => memory.remove_expired().await,
            MemoryStore::Purging(memory) => memory.remove_expired().await,
        }
    }

    async fn remove_since(&self, date: DateTime<Utc>) -> Result<()> {
        match self {
            MemoryStore::Bounded(memory) => memory.remove_since(date).await,
            MemoryStore::Purging(memory) => memory.remove_since(date).await,
        }
    }

    async fn remove_if_expired(&self, key: &str) -> Result<()> {
        match self {
            MemoryStore::Bounded(memory) => memory.remove_if_expired(key).await,
            MemoryStore::Purging(memory) => memory.remove_if_expired(key).await,
        }
    }
}

#[async_trait]
impl<T> MemoryTier<T> for MemoryStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn memory_capacity(&self) -> Option<u64> {
        match self {
            MemoryStore::Bounded(memory) => memory.memory_capacity().await,
            MemoryStore::Purging(memory) => memory.memory_capacity().await,
        }
    }

    async fn current_memory_usage(&self) -> Option<u64> {
        match self {
            MemoryStore::Bounded(memory) => memory.current_memory_usage().await,
            MemoryStore::Purging(memory) => memory.current_memory_usage().await,
        }
    }
}

type Storage<T> = HybridBackend<T, MemoryStore<T>>;

pub struct Warehouse<T> {
    storage: RwLock<Storage<T>>,
    /// Mirrors the installed disk tier so it can be read without the lock
    disk_capacity: AtomicU64,
    location: DiskLocation,
    serializer: Arc<dyn Serializer<T>>,
    pressure: Mutex<Option<MemoryPressure>>,
}

impl<T> Warehouse<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Bounded memory tier over a disk tier
    pub fn bounded(
        memory_config: BoundedMemoryConfig,
        disk_config: DiskConfig,
        location: DiskLocation,
        serializer: Arc<dyn Serializer<T>>,
    ) -> Self {
        let memory = MemoryStore::Bounded(BoundedMemoryBackend::new(memory_config));
        let disk = DiskBackend::new(disk_config, &location, serializer.clone());
        Self::from_storage(HybridBackend::new(memory, disk), location, serializer)
    }

    /// Auto-purging memory tier over a disk tier
    pub fn auto_purging(
        purging_config: AutoPurgingConfig,
        disk_config: DiskConfig,
        location: DiskLocation,
        serializer: Arc<dyn Serializer<T>>,
    ) -> Result<Self> {
        let storage = Self::purging_storage(purging_config, disk_config, &location, &serializer)?;
        Ok(Self::from_storage(storage, location, serializer))
    }

    fn from_storage(
        storage: Storage<T>,
        location: DiskLocation,
        serializer: Arc<dyn Serializer<T>>,
    ) -> Self {
        Self {
            disk_capacity: AtomicU64::new(storage.disk_capacity()),
            storage: RwLock::new(storage),
            location,
            serializer,
            pressure: Mutex::new(None),
        }
    }

    fn purging_storage(
        purging_config: AutoPurgingConfig,
        disk_config: DiskConfig,
        location: &DiskLocation,
        serializer: &Arc<dyn Serializer<T>>,
    ) -> Result<Storage<T>> {
        let memory = AutoPurgingBackend::new(purging_config, serializer.clone())?;
        let disk = DiskBackend::new(disk_config, location, serializer.clone());
        Ok(HybridBackend::new(MemoryStore::Purging(memory), disk))
    }

    /// Clear an auto-purging memory tier on low-memory warnings. The
    /// subscription carries over to storage installed by `update_capacity`.
    pub async fn watch_memory_pressure(&self, signal: &MemoryPressure) {
        let storage = self.storage.read().await;
        if let MemoryStore::Purging(memory) = storage.memory() {
            memory.watch_memory_pressure(signal);
        }
        *self.pressure.lock().unwrap_or_else(PoisonError::into_inner) = Some(signal.clone());
    }

    /// Replace the storage with an auto-purging memory tier and disk tier
    /// built from the new configurations, then purge the disk tier.
    ///
    /// The previous memory contents are dropped. Files in the same container
    /// stay and are subject to the new disk budget.
    pub async fn update_capacity(
        &self,
        purging_config: AutoPurgingConfig,
        disk_config: DiskConfig,
    ) -> Result<()> {
        let replacement =
            Self::purging_storage(purging_config, disk_config, &self.location, &self.serializer)?;

        let pressure = self
            .pressure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let (Some(signal), MemoryStore::Purging(memory)) = (pressure, replacement.memory()) {
            memory.watch_memory_pressure(&signal);
        }

        let memory_capacity = replacement.memory_capacity().await;
        let disk_capacity = replacement.disk_capacity();

        let mut storage = self.storage.write().await;
        *storage = replacement;
        self.disk_capacity.store(disk_capacity, Ordering::Relaxed);
        info!(?memory_capacity, disk_capacity, "Replaced warehouse storage");

        storage.disk().remove_expired().await
    }
}

#[async_trait]
impl<T> Backend<T> for Warehouse<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<CacheEntry<T>> {
        self.storage.read().await.get(key).await
    }

    async fn set(&self, key: &str, value: T, expiry: Option<Expiry>) -> Result<()> {
        self.storage.write().await.set(key, value, expiry).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.storage.write().await.remove(key).await
    }

    async fn remove_all(&self) -> Result<()> {
        self.storage.write().await.remove_all().await
    }

    async fn remove_expired(&self) -> Result<()> {
        self.storage.write().await.remove_expired().await
    }

    async fn remove_since(&self, date: DateTime<Utc>) -> Result<()> {
        self.storage.write().await.remove_since(date).await
    }

    async fn remove_if_expired(&self, key: &str) -> Result<()> {
        self.storage.write().await.remove_if_expired(key).await
    }
}

#[async_trait]
impl<T> MemoryTier<T> for Warehouse<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn memory_capacity(&self) -> Option<u64> {
        self.storage.read().await.memory_capacity().await
    }

    async fn current_memory_usage(&self) -> Option<u64> {
        self.storage.read().await.current_memory_usage().await
    }
}

#[async_trait]
impl<T> DiskTier<T> for Warehouse<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn disk_capacity(&self) -> u64 {
        self.disk_capacity.load(Ordering::Relaxed)
    }

    async fn current_disk_usage(&self) -> Option<u64> {
        self.storage.read().await.current_disk_usage().await
    }
}
