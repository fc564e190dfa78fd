//! Memory tier in front of a disk tier

use crate::backend::{Backend, DiskTier, MemoryTier};
use crate::disk::DiskBackend;
use crate::error::Result;
use crate::fs::{FileSystem, LocalFileSystem};
use crate::types::{CacheEntry, Expiry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::marker::PhantomData;
use tracing::debug;

/// Reads try memory then disk; disk hits are copied back into memory with
/// the disk entry's expiry. Writes and removals go to memory first, then
/// disk.
pub struct HybridBackend<T, M, F = LocalFileSystem> {
    memory: M,
    disk: DiskBackend<T, F>,
    _marker: PhantomData<fn() -> T>,
}

impl<T, M, F> HybridBackend<T, M, F>
where
    T: Clone + Send + Sync + 'static,
    M: MemoryTier<T>,
    F: FileSystem,
{
    pub fn new(memory: M, disk: DiskBackend<T, F>) -> Self {
        Self {
            memory,
            disk,
            _marker: PhantomData,
        }
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn disk(&self) -> &DiskBackend<T, F> {
        &self.disk
    }
}

#[async_trait]
impl<T, M, F> Backend<T> for HybridBackend<T, M, F>
where
    T: Clone + Send + Sync + 'static,
    M: MemoryTier<T>,
    F: FileSystem,
{
    async fn get(&self, key: &str) -> Result<CacheEntry<T>> {
        if let Ok(entry) = self.memory.get(key).await {
            return Ok(entry);
        }

        let entry = self.disk.get(key).await?;
        if let Err(e) = self
            .memory
            .set(key, entry.value.clone(), Some(entry.expiry))
            .await
        {
            debug!(key = %key, error = %e, "Failed to promote disk entry to memory");
        }
        Ok(entry)
    }

    async fn set(&self, key: &str, value: T, expiry: Option<Expiry>) -> Result<()> {
        self.memory.set(key, value.clone(), expiry).await?;
        self.disk.set(key, value, expiry).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.memory.remove(key).await?;
        self.disk.remove(key).await
    }

    async fn remove_all(&self) -> Result<()> {
        self.memory.remove_all().await?;
        self.disk.remove_all().await
    }

    async fn remove_expired(&self) -> Result<()> {
        self.memory.remove_expired().await?;
        self.disk.remove_expired().await
    }

    async fn remove_since(&self, date: DateTime<Utc>) -> Result<()> {
        self.memory.remove_since(date).await?;
        self.disk.remove_since(date).await
    }

    async fn remove_if_expired(&self, key: &str) -> Result<()> {
        self.memory.remove_if_expired(key).await?;
        self.disk.remove_if_expired(key).await
    }
}

#[async_trait]
impl<T, M, F> MemoryTier<T> for HybridBackend<T, M, F>
where
    T: Clone + Send + Sync + 'static,
    M: MemoryTier<T>,
    F: FileSystem,
{
    async fn memory_capacity(&self) -> Option<u64> {
        self.memory.memory_capacity().await
    }

    async fn current_memory_usage(&self) -> Option<u64> {
        self.memory.current_memory_usage().await
    }
}

#[async_trait]
impl<T, M, F> DiskTier<T> for HybridBackend<T, M, F>
where
    T: Clone + Send + Sync + 'static,
    M: MemoryTier<T>,
    F: FileSystem,
{
    fn disk_capacity(&self) -> u64 {
        self.disk.disk_capacity()
    }

    async fn current_disk_usage(&self) -> Option<u64> {
        self.disk.current_disk_usage().await
    }
}
