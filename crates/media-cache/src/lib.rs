//! Tiered media cache with expiry and byte-budget eviction
//!
//! Storage tiers share the [`Backend`] contract:
//!
//! - [`BoundedMemoryBackend`]: count/cost bounded memory, eviction delegated to moka
//! - [`AutoPurgingBackend`]: byte-budgeted memory with LRU purging
//! - [`DiskBackend`]: one file per key, expiry stored as the file's modification time
//!
//! [`HybridBackend`] puts a memory tier in front of the disk tier and
//! [`Warehouse`] serializes access to it. [`ImageCache`] is the two-tier
//! image cache with a serial disk queue and callback-style completion.

pub mod backend;
pub mod clock;
pub mod config;
pub mod disk;
pub mod error;
pub mod fs;
pub mod hybrid;
pub mod image;
pub mod image_cache;
pub mod memory;
pub mod purging;
pub mod serializer;
pub mod signal;
pub mod types;
pub mod warehouse;

pub use backend::{Backend, DiskTier, MemoryTier};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ImageCacheConfig;
pub use disk::{DiskBackend, DiskLocation};
pub use error::{CacheError, Result};
pub use fs::{FileSystem, LocalFileSystem};
pub use hybrid::HybridBackend;
pub use image::{Bitmap, PixelCost, Raster};
pub use image_cache::ImageCache;
pub use memory::BoundedMemoryBackend;
pub use purging::AutoPurgingBackend;
pub use serializer::{BytesSerializer, JsonSerializer, Serializer};
pub use signal::{MemoryPressure, Subscription};
pub use types::{
    AutoPurgingConfig, BoundedMemoryConfig, CacheEntry, CachePolicy, CacheStats, DiskConfig,
    Expiry, Protection,
};
pub use warehouse::{MemoryStore, Warehouse};
