//! Core types for the media cache janitor

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for one janitor run
#[derive(Debug, Clone)]
pub struct JanitorConfig {
    /// Platform caches directory holding the application folder
    pub cache_root: PathBuf,
    pub app_identifier: String,
    pub container: String,
    /// Byte budget enforced by the capacity purge; zero only drops expired files
    pub max_disk_size: u64,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from("./cache"),
            app_identifier: "media-cache".to_string(),
            container: "default".to_string(),
            max_disk_size: 150 * 1024 * 1024, // 150 MiB
        }
    }
}

/// Summary printed after a sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepReport {
    pub container: PathBuf,
    pub max_disk_size: u64,
    /// `None` when the folder could not be measured
    pub bytes_before: Option<u64>,
    pub bytes_after: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_janitor_config_default() {
        let config = JanitorConfig::default();
        assert_eq!(config.cache_root, PathBuf::from("./cache"));
        assert_eq!(config.app_identifier, "media-cache");
        assert_eq!(config.container, "default");
        assert_eq!(config.max_disk_size, 150 * 1024 * 1024);
    }

    #[test]
    fn test_sweep_report_serialization() {
        let report = SweepReport {
            container: PathBuf::from("/cache/app/default/objects"),
            max_disk_size: 1000,
            bytes_before: Some(1800),
            bytes_after: Some(300),
            started_at: Utc::now(),
            elapsed_ms: 12,
        };

        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("1800"));
        assert!(json.contains("objects"));

        let deserialized: SweepReport = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.bytes_after, Some(300));
        assert_eq!(deserialized.container, report.container);
    }

    #[test]
    fn test_unmeasurable_usage_serializes_as_null() {
        let report = SweepReport {
            container: PathBuf::from("/missing"),
            max_disk_size: 0,
            bytes_before: None,
            bytes_after: None,
            started_at: Utc::now(),
            elapsed_ms: 0,
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains(r#""bytes_before":null"#));
    }
}
