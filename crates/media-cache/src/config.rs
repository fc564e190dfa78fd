//! Image cache configuration

use crate::disk::platform_cache_dir;
use crate::types::CachePolicy;
use std::path::PathBuf;
use tracing::warn;

/// Prefix of every image cache folder name
pub const CACHE_BASE_NAME: &str = "media-cache.images";

pub const DEFAULT_CACHE_NAME: &str = "default";

/// 150 MiB
pub const DEFAULT_MAX_DISK_CAPACITY: u64 = 150 * 1024 * 1024;

/// 30 MiB
pub const DEFAULT_MAX_MEMORY_COST: u64 = 30 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ImageCacheConfig {
    pub name: String,
    /// Parent of the cache folder
    pub cache_root: PathBuf,
    pub policy: CachePolicy,
    pub max_disk_capacity: u64,
    pub max_memory_cost: u64,
}

impl ImageCacheConfig {
    pub fn new(name: impl Into<String>, cache_root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            cache_root: cache_root.into(),
            ..Default::default()
        }
    }

    /// Load from `MEDIA_CACHE_*` environment variables. Absent or
    /// unparsable values fall back to the defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars<F>(var: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let name = var("MEDIA_CACHE_NAME")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(defaults.name);

        let cache_root = var("MEDIA_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_root);

        let policy = match var("MEDIA_CACHE_POLICY") {
            Some(raw) => raw.parse::<CachePolicy>().unwrap_or_else(|e| {
                warn!(value = %raw, error = %e, "Ignoring MEDIA_CACHE_POLICY");
                defaults.policy
            }),
            None => defaults.policy,
        };

        let max_disk_capacity = var("MEDIA_CACHE_MAX_DISK_BYTES")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(defaults.max_disk_capacity);

        let max_memory_cost = var("MEDIA_CACHE_MAX_MEMORY_BYTES")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(defaults.max_memory_cost);

        Self {
            name,
            cache_root,
            policy,
            max_disk_capacity,
            max_memory_cost,
        }
    }

    /// `<cache_root>/<CACHE_BASE_NAME>.<name>`
    pub fn directory(&self) -> PathBuf {
        self.cache_root
            .join(format!("{}.{}", CACHE_BASE_NAME, self.name))
    }
}

impl Default for ImageCacheConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_CACHE_NAME.to_string(),
            cache_root: platform_cache_dir(),
            policy: CachePolicy::Disk,
            max_disk_capacity: DEFAULT_MAX_DISK_CAPACITY,
            max_memory_cost: DEFAULT_MAX_MEMORY_COST,
        }
    }
}
