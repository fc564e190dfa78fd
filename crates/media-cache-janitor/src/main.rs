//! Media cache janitor
//!
//! Sweeps one on-disk cache container: drops expired files, then enforces
//! the byte budget. Prints a JSON report of the folder size before and after.

mod error;
mod types;

use crate::error::Result;
use crate::types::{JanitorConfig, SweepReport};
use chrono::Utc;
use media_cache::{Backend, BytesSerializer, DiskBackend, DiskConfig, DiskLocation, DiskTier};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::from_default_env()
        .add_directive("media_cache_janitor=info".parse()?)
        .add_directive("media_cache=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    info!("Starting media cache janitor...");

    let config = load_config();
    info!("Cache root: {:?}", config.cache_root);
    info!("Container: {}/{}", config.app_identifier, config.container);
    info!("Max disk size: {} MB", config.max_disk_size / (1024 * 1024));

    let report = sweep(&config).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}

fn load_config() -> JanitorConfig {
    let defaults = JanitorConfig::default();

    let cache_root = std::env::var("CACHE_ROOT")
        .map(PathBuf::from)
        .unwrap_or(defaults.cache_root);

    let app_identifier = std::env::var("APP_IDENTIFIER").unwrap_or(defaults.app_identifier);

    let container = std::env::var("CACHE_CONTAINER").unwrap_or(defaults.container);

    let max_disk_size = std::env::var("MAX_DISK_SIZE")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(defaults.max_disk_size);

    JanitorConfig {
        cache_root,
        app_identifier,
        container,
        max_disk_size,
    }
}

/// Run the combined expiry and capacity purge over the configured container
async fn sweep(config: &JanitorConfig) -> Result<SweepReport> {
    let started_at = Utc::now();
    let timer = Instant::now();

    let location = DiskLocation::new(&config.cache_root, &config.app_identifier);
    let disk_config = DiskConfig {
        max_size_bytes: config.max_disk_size,
        ..DiskConfig::new(&config.container)
    };
    // File contents are never decoded, so the raw byte codec fits any container
    let disk: DiskBackend<Vec<u8>> =
        DiskBackend::new(disk_config, &location, Arc::new(BytesSerializer));

    let bytes_before = disk.current_disk_usage().await;
    disk.remove_expired().await?;
    let bytes_after = disk.current_disk_usage().await;

    info!(
        container = ?disk.path(),
        ?bytes_before,
        ?bytes_after,
        "Sweep finished"
    );

    Ok(SweepReport {
        container: disk.path().to_path_buf(),
        max_disk_size: config.max_disk_size,
        bytes_before,
        bytes_after,
        started_at,
        elapsed_ms: timer.elapsed().as_millis() as u64,
    })
}
