//! Auto-purging memory tier
//!
//! Holds values up to a byte budget. Each value's size is measured once with
//! the serializer when it is stored. When usage goes above the budget, a
//! purge pass drops the least recently accessed values until usage is back
//! at the preferred level.
//!
//! Reads share the lock and run concurrently; writes take it exclusively.
//! The purge pass triggered by `set` runs as a detached task, so `set` never
//! waits for it.

use crate::backend::{Backend, MemoryTier};
use crate::clock::{self, Clock};
use crate::error::{CacheError, Result};
use crate::serializer::Serializer;
use crate::signal::{MemoryPressure, Subscription};
use crate::types::{AutoPurgingConfig, CacheEntry, Expiry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;
use tracing::{debug, info};

struct MemoryCapsule<T> {
    key: String,
    entry: CacheEntry<T>,
    size_bytes: u64,
    /// Microseconds since the epoch of the last read or write
    last_access: AtomicI64,
    /// Tie-breaker for accesses within the same microsecond
    access_seq: AtomicU64,
}

impl<T> MemoryCapsule<T> {
    fn touch(&self, now: DateTime<Utc>, seq: u64) {
        self.last_access.store(now.timestamp_micros(), Ordering::Relaxed);
        self.access_seq.store(seq, Ordering::Relaxed);
    }

    fn recency(&self) -> (i64, u64) {
        (
            self.last_access.load(Ordering::Relaxed),
            self.access_seq.load(Ordering::Relaxed),
        )
    }
}

struct State<T> {
    capsules: HashMap<String, MemoryCapsule<T>>,
    memory_usage: u64,
}

struct Inner<T> {
    state: RwLock<State<T>>,
    config: AutoPurgingConfig,
    serializer: Arc<dyn Serializer<T>>,
    clock: Arc<dyn Clock>,
    access_counter: AtomicU64,
    subscription: Mutex<Option<Subscription>>,
}

impl<T> Inner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn next_seq(&self) -> u64 {
        self.access_counter.fetch_add(1, Ordering::Relaxed)
    }

    async fn get(&self, key: &str) -> Result<CacheEntry<T>> {
        let now = self.clock.now();
        {
            let state = self.state.read().await;
            let capsule = state.capsules.get(key).ok_or(CacheError::NotFound)?;
            if !capsule.entry.expiry.is_expired(now) {
                capsule.touch(now, self.next_seq());
                return Ok(capsule.entry.clone());
            }
        }

        self.remove_if(key, |capsule| capsule.entry.expiry.is_expired(now))
            .await;
        Err(CacheError::NotFound)
    }

    async fn set(&self, key: &str, value: T, expiry: Option<Expiry>) -> Result<()> {
        let size_bytes = self.serializer.to_bytes(&value)?.len() as u64;
        let now = self.clock.now();
        let capsule = MemoryCapsule {
            key: key.to_string(),
            entry: CacheEntry::new(value, expiry.unwrap_or(self.config.default_expiry)),
            size_bytes,
            last_access: AtomicI64::new(now.timestamp_micros()),
            access_seq: AtomicU64::new(self.next_seq()),
        };

        let mut state = self.state.write().await;
        if let Some(previous) = state.capsules.insert(key.to_string(), capsule) {
            state.memory_usage -= previous.size_bytes;
        }
        state.memory_usage += size_bytes;
        Ok(())
    }

    async fn purge_if_needed(&self) {
        let mut state = self.state.write().await;
        if state.memory_usage <= self.config.memory_capacity {
            return;
        }

        let bytes_to_purge = state.memory_usage - self.config.preferred_usage_after_purge;

        let mut candidates: Vec<((i64, u64), String, u64)> = state
            .capsules
            .values()
            .map(|capsule| (capsule.recency(), capsule.key.clone(), capsule.size_bytes))
            .collect();
        candidates.sort_by_key(|(recency, _, _)| *recency);

        let mut bytes_purged = 0u64;
        let mut removed = 0usize;
        for (_, key, size_bytes) in candidates {
            if bytes_purged >= bytes_to_purge {
                break;
            }
            state.capsules.remove(&key);
            bytes_purged += size_bytes;
            removed += 1;
        }
        state.memory_usage -= bytes_purged;

        debug!(
            removed,
            bytes_purged,
            memory_usage = state.memory_usage,
            "Purged least recently used entries"
        );
    }

    async fn remove_if<F>(&self, key: &str, predicate: F)
    where
        F: FnOnce(&MemoryCapsule<T>) -> bool,
    {
        let mut state = self.state.write().await;
        let matches = state.capsules.get(key).map(predicate).unwrap_or(false);
        if matches {
            if let Some(capsule) = state.capsules.remove(key) {
                state.memory_usage -= capsule.size_bytes;
            }
        }
    }

    async fn remove_expired_at(&self, date: DateTime<Utc>) {
        let mut state = self.state.write().await;
        let expired: Vec<String> = state
            .capsules
            .values()
            .filter(|capsule| capsule.entry.expiry.is_expired(date))
            .map(|capsule| capsule.key.clone())
            .collect();

        for key in &expired {
            if let Some(capsule) = state.capsules.remove(key) {
                state.memory_usage -= capsule.size_bytes;
            }
        }
        if !expired.is_empty() {
            debug!(removed = expired.len(), "Removed expired entries");
        }
    }

    async fn remove_all(&self) {
        let mut state = self.state.write().await;
        if state.capsules.is_empty() {
            return;
        }
        state.capsules.clear();
        state.memory_usage = 0;
    }
}

/// Memory tier with an explicit byte budget and LRU purging
pub struct AutoPurgingBackend<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for AutoPurgingBackend<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> AutoPurgingBackend<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Fails when `preferred_usage_after_purge` exceeds `memory_capacity`
    pub fn new(config: AutoPurgingConfig, serializer: Arc<dyn Serializer<T>>) -> Result<Self> {
        Self::with_clock(config, serializer, clock::system())
    }

    pub fn with_clock(
        config: AutoPurgingConfig,
        serializer: Arc<dyn Serializer<T>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State {
                    capsules: HashMap::new(),
                    memory_usage: 0,
                }),
                config,
                serializer,
                clock,
                access_counter: AtomicU64::new(0),
                subscription: Mutex::new(None),
            }),
        })
    }

    /// Drop every entry whenever `signal` reports low memory.
    ///
    /// The subscription ends when the last handle to this backend is dropped.
    pub fn watch_memory_pressure(&self, signal: &MemoryPressure) {
        let weak = Arc::downgrade(&self.inner);
        let subscription = signal.subscribe(move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => {
                        inner.remove_all().await;
                        info!("Low memory warning, cleared auto-purging cache");
                        true
                    }
                    None => false,
                }
            }
        });

        *self
            .inner
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(subscription);
    }

    pub fn config(&self) -> &AutoPurgingConfig {
        &self.inner.config
    }

    /// Run a purge pass now
    pub async fn purge_if_needed(&self) {
        self.inner.purge_if_needed().await;
    }

    /// Presence check that leaves recency untouched
    pub async fn contains(&self, key: &str) -> bool {
        self.inner.state.read().await.capsules.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.inner.state.read().await.capsules.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl<T> Backend<T> for AutoPurgingBackend<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<CacheEntry<T>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: T, expiry: Option<Expiry>) -> Result<()> {
        self.inner.set(key, value, expiry).await?;

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.purge_if_needed().await;
        });
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.inner.remove_if(key, |_| true).await;
        Ok(())
    }

    async fn remove_all(&self) -> Result<()> {
        self.inner.remove_all().await;
        Ok(())
    }

    async fn remove_expired(&self) -> Result<()> {
        self.inner.remove_expired_at(self.inner.clock.now()).await;
        Ok(())
    }

    async fn remove_since(&self, date: DateTime<Utc>) -> Result<()> {
        self.inner.remove_expired_at(date).await;
        Ok(())
    }

    async fn remove_if_expired(&self, key: &str) -> Result<()> {
        let now = self.inner.clock.now();
        self.inner
            .remove_if(key, |capsule| capsule.entry.expiry.is_expired(now))
            .await;
        Ok(())
    }
}

#[async_trait]
impl<T> MemoryTier<T> for AutoPurgingBackend<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn memory_capacity(&self) -> Option<u64> {
        Some(self.inner.config.memory_capacity)
    }

    async fn current_memory_usage(&self) -> Option<u64> {
        Some(self.inner.state.read().await.memory_usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::serializer::{BytesSerializer, JsonSerializer};
    use chrono::Duration;

    fn purging(capacity: u64, preferred: u64) -> (AutoPurgingBackend<Vec<u8>>, ManualClock) {
        let clock = ManualClock::default();
        let config = AutoPurgingConfig {
            memory_capacity: capacity,
            preferred_usage_after_purge: preferred,
            default_expiry: Expiry::Never,
        };
        let backend =
            AutoPurgingBackend::with_clock(config, Arc::new(BytesSerializer), Arc::new(clock.clone()))
                .unwrap();
        (backend, clock)
    }

    async fn usage(backend: &AutoPurgingBackend<Vec<u8>>) -> u64 {
        backend.current_memory_usage().await.unwrap()
    }

    #[test]
    fn test_rejects_preferred_above_capacity() {
        let config = AutoPurgingConfig {
            memory_capacity: 10,
            preferred_usage_after_purge: 11,
            default_expiry: Expiry::Never,
        };
        let result = AutoPurgingBackend::<Vec<u8>>::new(config, Arc::new(BytesSerializer));
        assert!(matches!(result, Err(CacheError::Config(_))));
    }

    #[tokio::test]
    async fn test_set_and_get_round_trip() {
        let clock = ManualClock::default();
        let backend = AutoPurgingBackend::with_clock(
            AutoPurgingConfig::default(),
            Arc::new(JsonSerializer::<String>::new()),
            Arc::new(clock),
        )
        .unwrap();

        backend.set("greeting", "hello".to_string(), None).await.unwrap();
        assert_eq!(backend.object("greeting").await.unwrap(), "hello");
        assert_eq!(
            backend.current_memory_usage().await,
            Some(r#"{"object":"hello"}"#.len() as u64)
        );
    }

    #[tokio::test]
    async fn test_replacing_key_replaces_size() {
        let (backend, _) = purging(1000, 500);
        backend.set("a", vec![0; 40], None).await.unwrap();
        backend.set("a", vec![0; 10], None).await.unwrap();
        assert_eq!(usage(&backend).await, 10);
        assert_eq!(backend.len().await, 1);
    }

    #[tokio::test]
    async fn test_remove_updates_usage_and_is_idempotent() {
        let (backend, _) = purging(1000, 500);
        backend.set("a", vec![0; 40], None).await.unwrap();
        backend.set("b", vec![0; 20], None).await.unwrap();

        backend.remove("a").await.unwrap();
        backend.remove("a").await.unwrap();
        assert_eq!(usage(&backend).await, 20);
    }

    #[tokio::test]
    async fn test_purge_is_noop_under_capacity() {
        let (backend, _) = purging(100, 60);
        for key in ["a", "b", "c", "d"] {
            backend.set(key, vec![0; 25], None).await.unwrap();
        }
        backend.purge_if_needed().await;
        assert_eq!(usage(&backend).await, 100);
        assert_eq!(backend.len().await, 4);
    }

    #[tokio::test]
    async fn test_purge_starts_from_oldest_and_stops_at_preferred() {
        let (backend, clock) = purging(100, 60);
        for key in ["A", "B", "C", "D", "E"] {
            backend.set(key, vec![0; 25], None).await.unwrap();
            clock.advance(Duration::seconds(1));
        }

        backend.purge_if_needed().await;

        // 125 bytes, 65 to purge: A, B and C go (75 bytes), D and E stay
        assert!(usage(&backend).await <= 60);
        assert!(!backend.contains("A").await);
        assert!(!backend.contains("B").await);
        assert!(!backend.contains("C").await);
        assert!(backend.contains("D").await);
        assert!(backend.contains("E").await);
    }

    #[tokio::test]
    async fn test_recently_read_entry_survives_purge() {
        let (backend, clock) = purging(100, 60);
        for key in ["A", "B", "C", "D"] {
            backend.set(key, vec![0; 25], None).await.unwrap();
            clock.advance(Duration::seconds(1));
        }
        backend.get("A").await.unwrap();
        clock.advance(Duration::seconds(1));
        backend.set("E", vec![0; 25], None).await.unwrap();

        backend.purge_if_needed().await;

        assert!(usage(&backend).await <= 60);
        assert!(backend.contains("A").await);
        assert!(backend.contains("E").await);
        assert!(!backend.contains("B").await);
    }

    #[tokio::test]
    async fn test_set_schedules_purge() {
        let (backend, _) = purging(100, 60);
        for i in 0..8 {
            backend.set(&format!("k{}", i), vec![0; 25], None).await.unwrap();
        }

        for _ in 0..100 {
            if usage(&backend).await <= 100 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(usage(&backend).await <= 100);
    }

    #[tokio::test]
    async fn test_auto_purging_expiry_is_inclusive_at_deadline() {
        let (backend, clock) = purging(1000, 500);
        let expiry = Expiry::after(Duration::seconds(30), clock.now());
        backend.set("a", vec![1, 2, 3], Some(expiry)).await.unwrap();

        clock.advance(Duration::seconds(29));
        assert!(backend.get("a").await.is_ok());

        // Expired once the deadline is reached (`expiry <= now`)
        clock.advance(Duration::seconds(1));
        assert!(backend.get("a").await.unwrap_err().is_not_found());
        assert_eq!(usage(&backend).await, 0);
    }

    #[tokio::test]
    async fn test_remove_expired_and_remove_since() {
        let (backend, clock) = purging(1000, 500);
        let soon = Expiry::after(Duration::seconds(10), clock.now());
        let later = Expiry::after(Duration::hours(2), clock.now());
        backend.set("soon", vec![0; 5], Some(soon)).await.unwrap();
        backend.set("later", vec![0; 7], Some(later)).await.unwrap();
        backend.set("never", vec![0; 9], None).await.unwrap();

        clock.advance(Duration::minutes(1));
        backend.remove_expired().await.unwrap();
        assert!(!backend.contains("soon").await);
        assert_eq!(usage(&backend).await, 16);

        backend
            .remove_since(clock.now() + Duration::hours(3))
            .await
            .unwrap();
        assert!(!backend.contains("later").await);
        assert!(backend.contains("never").await);
        assert_eq!(usage(&backend).await, 9);
    }

    #[tokio::test]
    async fn test_remove_if_expired() {
        let (backend, clock) = purging(1000, 500);
        let expiry = Expiry::after(Duration::seconds(5), clock.now());
        backend.set("a", vec![0; 5], Some(expiry)).await.unwrap();

        backend.remove_if_expired("a").await.unwrap();
        assert!(backend.contains("a").await);

        clock.advance(Duration::seconds(5));
        backend.remove_if_expired("a").await.unwrap();
        assert!(!backend.contains("a").await);
        backend.remove_if_expired("a").await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_pressure_clears_everything() {
        let (backend, _) = purging(1000, 500);
        let signal = MemoryPressure::new();
        backend.watch_memory_pressure(&signal);

        backend.set("a", vec![0; 5], None).await.unwrap();
        backend.set("b", vec![0; 5], None).await.unwrap();

        assert_eq!(signal.notify(), 1);
        for _ in 0..100 {
            if backend.is_empty().await {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(backend.is_empty().await);
        assert_eq!(usage(&backend).await, 0);

        // A second warning on an empty cache is harmless
        signal.notify();
    }

    #[tokio::test]
    async fn test_dropping_backend_unsubscribes() {
        let (backend, _) = purging(1000, 500);
        let signal = MemoryPressure::new();
        backend.watch_memory_pressure(&signal);
        assert_eq!(signal.subscriber_count(), 1);

        drop(backend);
        for _ in 0..100 {
            if signal.subscriber_count() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(signal.subscriber_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_keep_usage_consistent() {
        let (backend, _) = purging(1_000_000, 500_000);

        let mut handles = Vec::new();
        for worker in 0..8 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..50 {
                    let key = format!("w{}-{}", worker, i);
                    backend.set(&key, vec![0; 10], None).await.unwrap();
                    backend.get(&key).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(backend.len().await, 400);
        assert_eq!(usage(&backend).await, 4000);
    }

    #[tokio::test]
    async fn test_capacity_accessors() {
        let (backend, _) = purging(100, 60);
        assert_eq!(backend.memory_capacity().await, Some(100));
        assert_eq!(backend.current_memory_usage().await, Some(0));
    }
}
