//! End-to-end cache behaviour through the public API

use chrono::{DateTime, Duration, Utc};
use media_cache::{
    AutoPurgingBackend, AutoPurgingConfig, Backend, BoundedMemoryBackend, BoundedMemoryConfig,
    BytesSerializer, Clock, DiskBackend, DiskConfig, DiskLocation, DiskTier, Expiry, HybridBackend,
    ImageCache, ImageCacheConfig, JsonSerializer, LocalFileSystem, ManualClock, MemoryTier,
    Serializer, Warehouse,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tempfile::tempdir;

fn fixed_now() -> DateTime<Utc> {
    DateTime::from_timestamp(1_900_000_000, 0).unwrap()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Observation {
    id: u64,
    species: String,
    photos: Vec<String>,
}

fn observation(id: u64) -> Observation {
    Observation {
        id,
        species: "Strix varia".to_string(),
        photos: vec![format!("https://cdn.example.com/{}.jpg", id)],
    }
}

#[tokio::test]
async fn test_auto_purging_scenario_evicts_from_oldest_down_to_preferred() {
    let clock = ManualClock::new(fixed_now());
    let config = AutoPurgingConfig {
        memory_capacity: 100,
        preferred_usage_after_purge: 60,
        default_expiry: Expiry::Never,
    };
    let cache =
        AutoPurgingBackend::with_clock(config, Arc::new(BytesSerializer), Arc::new(clock.clone()))
            .unwrap();

    for key in ["A", "B", "C", "D", "E"] {
        cache.set(key, vec![0u8; 25], None).await.unwrap();
        clock.advance(Duration::seconds(1));
    }
    cache.purge_if_needed().await;

    assert!(cache.current_memory_usage().await.unwrap() <= 60);
    assert!(!cache.contains("A").await);
    assert!(cache.contains("E").await);
}

#[tokio::test]
async fn test_disk_scenario_capacity_purge_removes_newest_files_suspected_defect() {
    let dir = tempdir().unwrap();
    let clock = ManualClock::new(fixed_now());
    let config = DiskConfig {
        max_size_bytes: 1000,
        ..DiskConfig::new("scenario")
    };
    let disk: DiskBackend<Vec<u8>> = DiskBackend::with_file_system(
        config,
        &DiskLocation::new(dir.path(), "app"),
        Arc::new(BytesSerializer),
        LocalFileSystem,
        Arc::new(clock.clone()),
    );

    for i in 1..=6 {
        let expiry = Expiry::after(Duration::hours(i), clock.now());
        disk.set(&format!("file{}", i), vec![0u8; 300], Some(expiry))
            .await
            .unwrap();
    }

    disk.remove_expired().await.unwrap();

    assert!(disk.current_disk_usage().await.unwrap() <= 500);
    assert!(!disk.exists("file6").await);
    assert!(!disk.exists("file5").await);
    assert!(disk.exists("file1").await);
}

#[tokio::test]
async fn test_expiry_is_inclusive_for_auto_purging_and_strict_for_disk() {
    let dir = tempdir().unwrap();
    let clock = ManualClock::new(fixed_now());
    let deadline = Expiry::after(Duration::minutes(10), clock.now());

    let memory = AutoPurgingBackend::with_clock(
        AutoPurgingConfig::default(),
        Arc::new(BytesSerializer),
        Arc::new(clock.clone()),
    )
    .unwrap();
    let disk: DiskBackend<Vec<u8>> = DiskBackend::with_file_system(
        DiskConfig::new("expiry"),
        &DiskLocation::new(dir.path(), "app"),
        Arc::new(BytesSerializer),
        LocalFileSystem,
        Arc::new(clock.clone()),
    );
    memory.set("k", vec![1], Some(deadline)).await.unwrap();
    disk.set("k", vec![1], Some(deadline)).await.unwrap();

    clock.set(deadline.date());
    // Auto-purging: expiry <= now
    assert!(memory.get("k").await.unwrap_err().is_not_found());
    // Disk: now > mtime
    assert!(disk.get("k").await.is_ok());

    clock.advance(Duration::seconds(1));
    assert!(disk.get("k").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_every_backend_round_trips_values() {
    let dir = tempdir().unwrap();
    let location = DiskLocation::new(dir.path(), "app");
    let json: Arc<dyn Serializer<Observation>> = Arc::new(JsonSerializer::<Observation>::new());

    let bounded = BoundedMemoryBackend::<Observation>::new(BoundedMemoryConfig::default());
    let purging = AutoPurgingBackend::new(AutoPurgingConfig::default(), json.clone()).unwrap();
    let disk: DiskBackend<Observation> =
        DiskBackend::new(DiskConfig::new("round-trip"), &location, json.clone());
    let hybrid = HybridBackend::new(
        BoundedMemoryBackend::<Observation>::new(BoundedMemoryConfig::default()),
        DiskBackend::new(DiskConfig::new("hybrid"), &location, json.clone()),
    );
    let warehouse = Warehouse::auto_purging(
        AutoPurgingConfig::default(),
        DiskConfig::new("warehouse"),
        location.clone(),
        json,
    )
    .unwrap();

    let backends: Vec<Box<dyn Backend<Observation>>> = vec![
        Box::new(bounded),
        Box::new(purging),
        Box::new(disk),
        Box::new(hybrid),
        Box::new(warehouse),
    ];

    for (i, backend) in backends.iter().enumerate() {
        let value = observation(i as u64);
        backend.set("obs", value.clone(), None).await.unwrap();
        assert_eq!(backend.object("obs").await.unwrap(), value, "backend {}", i);

        backend.remove("obs").await.unwrap();
        backend.remove("obs").await.unwrap();
        assert!(!backend.exists("obs").await, "backend {}", i);
        assert!(backend.is_expired("obs", Utc::now()).await, "backend {}", i);
    }
}

#[tokio::test]
async fn test_image_cache_survives_memory_loss_through_disk() {
    let dir = tempdir().unwrap();
    let cache: ImageCache<Vec<u8>> = ImageCache::new(
        ImageCacheConfig::new("photos", dir.path()),
        Arc::new(BytesSerializer),
    )
    .unwrap();

    let jpeg = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
    cache.store("owl.jpg", jpeg.clone(), Some(jpeg.clone())).await;
    cache.clear_memory();

    assert_eq!(cache.load("owl.jpg").await, Some(jpeg));
    assert_eq!(cache.current_disk_usage().await, Some(6));

    cache.remove("owl.jpg");
    assert!(!cache.has_cached("owl.jpg").await);
    assert_eq!(cache.current_disk_usage().await, Some(0));
}
