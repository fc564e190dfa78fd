//! Cache types

use crate::error::{CacheError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Seconds after the Unix epoch used as the stand-in date for `Expiry::Never`.
///
/// This lands in December 2037. Disk entries stamped with it count as
/// expired from then on, so `Never` on disk is a far deadline, not infinity.
const DISTANT_FUTURE_SECS: i64 = 60 * 60 * 24 * 365 * 68;

/// When a cached value stops being served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Expiry {
    #[default]
    Never,
    At(DateTime<Utc>),
}

impl Expiry {
    pub fn seconds_from_epoch(secs: f64) -> Self {
        DateTime::from_timestamp_millis((secs * 1000.0) as i64)
            .map(Expiry::At)
            .unwrap_or(Expiry::Never)
    }

    pub fn after(ttl: Duration, now: DateTime<Utc>) -> Self {
        Expiry::At(now + ttl)
    }

    /// Concrete instant for this expiry; `Never` maps to a fixed distant-future date
    pub fn date(&self) -> DateTime<Utc> {
        match self {
            Expiry::Never => {
                DateTime::from_timestamp(DISTANT_FUTURE_SECS, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
            }
            Expiry::At(date) => *date,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self {
            Expiry::Never => false,
            Expiry::At(date) => *date <= now,
        }
    }
}

/// A cached value together with its expiry.
///
/// `disk_path` is only set on entries read back from the disk tier.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub value: T,
    pub expiry: Expiry,
    pub disk_path: Option<PathBuf>,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, expiry: Expiry) -> Self {
        Self {
            value,
            expiry,
            disk_path: None,
        }
    }
}

/// Configuration for the auto-purging memory tier
#[derive(Debug, Clone)]
pub struct AutoPurgingConfig {
    /// Byte budget; a purge runs when usage goes above it
    pub memory_capacity: u64,
    /// Usage a purge brings the tier back down to
    pub preferred_usage_after_purge: u64,
    pub default_expiry: Expiry,
}

impl AutoPurgingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.preferred_usage_after_purge > self.memory_capacity {
            return Err(CacheError::Config(format!(
                "preferred usage after purge ({}) exceeds memory capacity ({})",
                self.preferred_usage_after_purge, self.memory_capacity
            )));
        }
        Ok(())
    }
}

impl Default for AutoPurgingConfig {
    fn default() -> Self {
        Self {
            memory_capacity: 100_000_000,
            preferred_usage_after_purge: 60_000_000,
            default_expiry: Expiry::Never,
        }
    }
}

/// Configuration for the bounded memory tier. A zero limit means unlimited.
#[derive(Debug, Clone, Default)]
pub struct BoundedMemoryConfig {
    pub count_limit: u32,
    pub total_cost_limit: u64,
    pub default_expiry: Expiry,
}

/// Permissions applied to the disk tier's folder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// rwx------
    OwnerOnly,
    /// rwxr-xr-x
    OwnerWriteOthersRead,
}

impl Protection {
    pub fn mode(&self) -> u32 {
        match self {
            Protection::OwnerOnly => 0o700,
            Protection::OwnerWriteOthersRead => 0o755,
        }
    }
}

/// Configuration for the on-disk tier
#[derive(Debug, Clone)]
pub struct DiskConfig {
    /// Byte budget; zero disables the capacity purge
    pub max_size_bytes: u64,
    pub default_expiry: Expiry,
    /// Folder name of this cache inside the application's cache directory
    pub container_name: String,
    pub protection: Option<Protection>,
}

impl DiskConfig {
    pub fn new(container_name: impl Into<String>) -> Self {
        Self {
            max_size_bytes: 0,
            default_expiry: Expiry::Never,
            container_name: container_name.into(),
            protection: None,
        }
    }
}

/// Which tiers the image cache writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    None,
    Memory,
    #[default]
    Disk,
}

impl CachePolicy {
    pub fn includes_memory(&self) -> bool {
        matches!(self, CachePolicy::Memory | CachePolicy::Disk)
    }

    pub fn includes_disk(&self) -> bool {
        matches!(self, CachePolicy::Disk)
    }
}

impl FromStr for CachePolicy {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(CachePolicy::None),
            "memory" => Ok(CachePolicy::Memory),
            "disk" => Ok(CachePolicy::Disk),
            other => Err(CacheError::Config(format!("Unknown cache policy: {}", other))),
        }
    }
}

/// Statistics about the image cache
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_size: u64,
    pub hits: u64,
    pub misses: u64,
}
