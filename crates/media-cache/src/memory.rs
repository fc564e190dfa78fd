//! Bounded memory tier
//!
//! Count and cost limits are enforced by moka; this module adds expiry and
//! typed access on top. Values are stored type-erased so several typed
//! views can share one store, and a read through the wrong view reports
//! `TypeMismatch`.

use crate::backend::{Backend, MemoryTier};
use crate::clock::{self, Clock};
use crate::error::{CacheError, Result};
use crate::types::{BoundedMemoryConfig, CacheEntry, Expiry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::sync::Cache;
use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
struct Capsule {
    value: Arc<dyn Any + Send + Sync>,
    expiry: Expiry,
    cost: u64,
}

pub struct BoundedMemoryBackend<T> {
    store: Cache<String, Capsule>,
    config: Arc<BoundedMemoryConfig>,
    clock: Arc<dyn Clock>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for BoundedMemoryBackend<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config.clone(),
            clock: self.clock.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> BoundedMemoryBackend<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: BoundedMemoryConfig) -> Self {
        Self::with_clock(config, clock::system())
    }

    pub fn with_clock(config: BoundedMemoryConfig, clock: Arc<dyn Clock>) -> Self {
        let store = build_store(&config);
        Self {
            store,
            config: Arc::new(config),
            clock,
            _marker: PhantomData,
        }
    }

    /// Typed handle over the same underlying store
    pub fn view<U>(&self) -> BoundedMemoryBackend<U>
    where
        U: Clone + Send + Sync + 'static,
    {
        BoundedMemoryBackend {
            store: self.store.clone(),
            config: self.config.clone(),
            clock: self.clock.clone(),
            _marker: PhantomData,
        }
    }

    pub fn config(&self) -> &BoundedMemoryConfig {
        &self.config
    }

    /// Read an entry; expired entries are dropped and reported as missing
    pub fn lookup(&self, key: &str) -> Result<CacheEntry<T>> {
        let capsule = self.store.get(key).ok_or(CacheError::NotFound)?;

        if capsule.expiry.is_expired(self.clock.now()) {
            self.store.invalidate(key);
            return Err(CacheError::NotFound);
        }

        let value = capsule
            .value
            .downcast::<T>()
            .map_err(|_| CacheError::TypeMismatch)?;

        Ok(CacheEntry::new(T::clone(&value), capsule.expiry))
    }

    /// Store a value with an explicit eviction cost
    pub fn insert(&self, key: &str, value: T, expiry: Option<Expiry>, cost: u64) {
        let capsule = Capsule {
            value: Arc::new(value),
            expiry: expiry.unwrap_or(self.config.default_expiry),
            cost,
        };
        self.store.insert(key.to_string(), capsule);
    }

    pub fn invalidate(&self, key: &str) {
        self.store.invalidate(key);
    }

    pub fn clear(&self) {
        self.store.invalidate_all();
    }

    pub fn contains(&self, key: &str) -> bool {
        self.store.contains_key(key)
    }

    pub fn entry_count(&self) -> u64 {
        self.store.run_pending_tasks();
        self.store.entry_count()
    }

    fn purge_expired(&self, date: DateTime<Utc>) {
        let expired: Vec<Arc<String>> = self
            .store
            .iter()
            .filter(|(_, capsule)| capsule.expiry.is_expired(date))
            .map(|(key, _)| key)
            .collect();

        for key in &expired {
            self.store.invalidate(key.as_str());
        }
        if !expired.is_empty() {
            debug!(removed = expired.len(), "Removed expired memory entries");
        }
    }
}

fn build_store(config: &BoundedMemoryConfig) -> Cache<String, Capsule> {
    let builder = Cache::builder();

    if config.total_cost_limit > 0 {
        // Every entry weighs at least its share of the cost budget, so the
        // cost limit also caps the entry count.
        let floor = if config.count_limit > 0 {
            config.total_cost_limit / u64::from(config.count_limit)
        } else {
            0
        };
        builder
            .max_capacity(config.total_cost_limit)
            .weigher(move |_key: &String, capsule: &Capsule| {
                u32::try_from(capsule.cost.max(floor)).unwrap_or(u32::MAX)
            })
            .build()
    } else if config.count_limit > 0 {
        builder.max_capacity(u64::from(config.count_limit)).build()
    } else {
        builder.build()
    }
}

#[async_trait]
impl<T> Backend<T> for BoundedMemoryBackend<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<CacheEntry<T>> {
        self.lookup(key)
    }

    async fn set(&self, key: &str, value: T, expiry: Option<Expiry>) -> Result<()> {
        self.insert(key, value, expiry, 0);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.invalidate(key);
        Ok(())
    }

    async fn remove_all(&self) -> Result<()> {
        self.clear();
        Ok(())
    }

    async fn remove_expired(&self) -> Result<()> {
        self.purge_expired(self.clock.now());
        Ok(())
    }

    async fn remove_since(&self, date: DateTime<Utc>) -> Result<()> {
        self.purge_expired(date);
        Ok(())
    }

    async fn remove_if_expired(&self, key: &str) -> Result<()> {
        if let Some(capsule) = self.store.get(key) {
            if capsule.expiry.is_expired(self.clock.now()) {
                self.store.invalidate(key);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<T> MemoryTier<T> for BoundedMemoryBackend<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn memory_capacity(&self) -> Option<u64> {
        None
    }

    async fn current_memory_usage(&self) -> Option<u64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration;

    fn backend_with_clock() -> (BoundedMemoryBackend<String>, ManualClock) {
        let clock = ManualClock::default();
        let backend =
            BoundedMemoryBackend::with_clock(BoundedMemoryConfig::default(), Arc::new(clock.clone()));
        (backend, clock)
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let (backend, _) = backend_with_clock();
        backend.set("a", "alpha".to_string(), None).await.unwrap();

        let entry = backend.get("a").await.unwrap();
        assert_eq!(entry.value, "alpha");
        assert_eq!(entry.expiry, Expiry::Never);
        assert!(entry.disk_path.is_none());
    }

    #[tokio::test]
    async fn test_miss_is_not_found() {
        let (backend, _) = backend_with_clock();
        assert!(backend.get("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_wrong_type_is_type_mismatch() {
        let (strings, _) = backend_with_clock();
        let numbers = strings.view::<u32>();

        strings.set("k", "text".to_string(), None).await.unwrap();
        assert!(matches!(numbers.get("k").await, Err(CacheError::TypeMismatch)));

        numbers.set("n", 7, None).await.unwrap();
        assert_eq!(numbers.object("n").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_get_after_expiry_inclusive_is_not_found() {
        let (backend, clock) = backend_with_clock();
        let expiry = Expiry::after(Duration::seconds(10), clock.now());
        backend.set("a", "alpha".to_string(), Some(expiry)).await.unwrap();

        clock.advance(Duration::seconds(10));
        assert!(backend.get("a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_default_expiry_applies() {
        let clock = ManualClock::default();
        let config = BoundedMemoryConfig {
            default_expiry: Expiry::after(Duration::seconds(5), clock.now()),
            ..Default::default()
        };
        let backend = BoundedMemoryBackend::<String>::with_clock(config, Arc::new(clock.clone()));
        backend.set("a", "alpha".to_string(), None).await.unwrap();

        assert_eq!(
            backend.get("a").await.unwrap().expiry,
            Expiry::At(clock.now() + Duration::seconds(5))
        );
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (backend, _) = backend_with_clock();
        backend.set("a", "alpha".to_string(), None).await.unwrap();
        backend.remove("a").await.unwrap();
        backend.remove("a").await.unwrap();
        assert!(!backend.exists("a").await);
    }

    #[tokio::test]
    async fn test_remove_expired_keeps_live_entries() {
        let (backend, clock) = backend_with_clock();
        let soon = Expiry::after(Duration::seconds(1), clock.now());
        let later = Expiry::after(Duration::hours(1), clock.now());
        backend.set("old", "x".to_string(), Some(soon)).await.unwrap();
        backend.set("new", "y".to_string(), Some(later)).await.unwrap();
        backend.set("forever", "z".to_string(), None).await.unwrap();

        clock.advance(Duration::minutes(1));
        backend.remove_expired().await.unwrap();

        assert!(!backend.contains("old"));
        assert!(backend.contains("new"));
        assert!(backend.contains("forever"));
    }

    #[tokio::test]
    async fn test_remove_since_uses_given_date() {
        let (backend, clock) = backend_with_clock();
        let in_an_hour = Expiry::after(Duration::hours(1), clock.now());
        backend.set("a", "x".to_string(), Some(in_an_hour)).await.unwrap();

        backend
            .remove_since(clock.now() + Duration::hours(2))
            .await
            .unwrap();
        assert!(!backend.contains("a"));
    }

    #[tokio::test]
    async fn test_remove_if_expired() {
        let (backend, clock) = backend_with_clock();
        let soon = Expiry::after(Duration::seconds(1), clock.now());
        backend.set("a", "x".to_string(), Some(soon)).await.unwrap();

        backend.remove_if_expired("a").await.unwrap();
        assert!(backend.contains("a"));

        clock.advance(Duration::seconds(2));
        backend.remove_if_expired("a").await.unwrap();
        assert!(!backend.contains("a"));

        // Absent key is fine
        backend.remove_if_expired("missing").await.unwrap();
    }

    #[tokio::test]
    async fn test_capacity_accessors_not_applicable() {
        let (backend, _) = backend_with_clock();
        assert_eq!(backend.memory_capacity().await, None);
        assert_eq!(backend.current_memory_usage().await, None);
    }

    #[tokio::test]
    async fn test_count_limit_bounds_entries() {
        let config = BoundedMemoryConfig {
            count_limit: 4,
            ..Default::default()
        };
        let backend = BoundedMemoryBackend::<u32>::new(config);
        for i in 0..32 {
            backend.set(&format!("k{}", i), i, None).await.unwrap();
        }
        assert!(backend.entry_count() <= 4);
    }

    #[tokio::test]
    async fn test_cost_limit_bounds_entries() {
        let config = BoundedMemoryConfig {
            total_cost_limit: 1000,
            ..Default::default()
        };
        let backend = BoundedMemoryBackend::<u32>::new(config);
        for i in 0..20 {
            backend.insert(&format!("k{}", i), i, None, 300);
        }
        assert!(backend.entry_count() <= 3);
    }

    #[tokio::test]
    async fn test_remove_all() {
        let (backend, _) = backend_with_clock();
        backend.set("a", "x".to_string(), None).await.unwrap();
        backend.set("b", "y".to_string(), None).await.unwrap();
        backend.remove_all().await.unwrap();
        assert!(backend.get("a").await.unwrap_err().is_not_found());
        assert!(backend.get("b").await.unwrap_err().is_not_found());
    }
}
