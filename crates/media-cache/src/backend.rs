//! Contract shared by every cache tier

use crate::error::Result;
use crate::types::{CacheEntry, Expiry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// A storage tier keyed by string.
///
/// `get` refreshes the entry's recency metadata as a side effect, since
/// recency drives eviction order. Removing an absent key is not an error.
#[async_trait]
pub trait Backend<T>: Send + Sync
where
    T: Send + 'static,
{
    async fn get(&self, key: &str) -> Result<CacheEntry<T>>;

    /// Store `value`; `None` falls back to the tier's default expiry
    async fn set(&self, key: &str, value: T, expiry: Option<Expiry>) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    async fn remove_all(&self) -> Result<()>;

    async fn remove_expired(&self) -> Result<()>;

    /// Remove everything that is expired as of `date`
    async fn remove_since(&self, date: DateTime<Utc>) -> Result<()>;

    async fn remove_if_expired(&self, key: &str) -> Result<()>;

    async fn object(&self, key: &str) -> Result<T> {
        Ok(self.get(key).await?.value)
    }

    async fn exists(&self, key: &str) -> bool {
        self.get(key).await.is_ok()
    }

    /// Missing or unreadable entries count as expired
    async fn is_expired(&self, key: &str, now: DateTime<Utc>) -> bool {
        match self.get(key).await {
            Ok(entry) => entry.expiry.is_expired(now),
            Err(_) => true,
        }
    }
}

/// Memory tiers report their byte budget and usage; `None` means the tier
/// does not track it
#[async_trait]
pub trait MemoryTier<T>: Backend<T>
where
    T: Send + 'static,
{
    async fn memory_capacity(&self) -> Option<u64>;

    async fn current_memory_usage(&self) -> Option<u64>;
}

/// Disk tiers report their byte budget and usage; `None` usage means the
/// directory could not be measured
#[async_trait]
pub trait DiskTier<T>: Backend<T>
where
    T: Send + 'static,
{
    fn disk_capacity(&self) -> u64;

    async fn current_disk_usage(&self) -> Option<u64>;
}
