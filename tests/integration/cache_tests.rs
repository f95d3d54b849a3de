//! Cache tier integration tests.
//!
//! Tests verify:
//! - The memory cache stays within its byte budget and evicts LRU tiles
//! - Evicted tiles are reloaded from the disk store instead of re-rendered
//! - The disk store survives a restart and serves identical validators
//! - Flushing persists tiles that only lived in memory

use std::sync::Arc;

use axum::http::{header, StatusCode};
use http_body_util::BodyExt;

use map_tile_server::store::{tile_path, PersistentTileStore, StoreConfig};
use map_tile_server::tile::{ImageFormat, TileCacheBuilder, TileKey, TileService};

use super::test_utils::{get, test_router, test_service, StubEngine};

fn open_store(dir: &std::path::Path) -> Arc<PersistentTileStore> {
    Arc::new(PersistentTileStore::open(StoreConfig::new(dir, 1 << 30)).unwrap())
}

/// Weight of one stub PNG tile in the memory cache.
async fn stub_tile_weight() -> u64 {
    let sample = test_service(StubEngine::new(), None);
    let tile = sample.get_tile(TileKey::new(1, 0, 0, ImageFormat::Png)).await.unwrap();
    tile.weight() as u64
}

/// A service whose single-shard cache holds exactly two stub tiles.
async fn two_tile_service(store: Option<Arc<PersistentTileStore>>) -> Arc<TileService<StubEngine>> {
    let weight = stub_tile_weight().await;
    let cache = TileCacheBuilder::new(weight * 2 + weight / 2)
        .concurrency_level(1)
        .build();
    Arc::new(TileService::new(Arc::new(StubEngine::new()), cache, store))
}

// =============================================================================
// Memory Cache
// =============================================================================

#[tokio::test]
async fn test_memory_cache_evicts_least_recently_used() {
    let service = two_tile_service(None).await;
    let a = TileKey::new(2, 0, 0, ImageFormat::Png);
    let b = TileKey::new(2, 1, 0, ImageFormat::Png);
    let c = TileKey::new(2, 2, 0, ImageFormat::Png);

    service.get_tile(a).await.unwrap();
    service.get_tile(b).await.unwrap();
    // Touch a so that b becomes least recently used
    service.get_tile(a).await.unwrap();
    service.get_tile(c).await.unwrap();

    assert_eq!(service.cache().len(), 2);
    assert!(service.cache().weight() <= service.cache().capacity());
    assert_eq!(service.cache_stats().evictions, 1);
    assert_eq!(service.engine().renders(), 3);

    service.get_tile(a).await.unwrap();
    assert_eq!(service.engine().renders(), 3, "a should still be cached");

    service.get_tile(b).await.unwrap();
    assert_eq!(service.engine().renders(), 4, "b should have been evicted");
}

#[tokio::test]
async fn test_evicted_tile_reloaded_from_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    let service = two_tile_service(Some(store.clone())).await;

    let keys: Vec<TileKey> = (0..3).map(|x| TileKey::new(2, x, 1, ImageFormat::Png)).collect();
    let mut first = Vec::new();
    for key in &keys {
        first.push(service.get_tile(*key).await.unwrap());
    }
    assert_eq!(service.engine().renders(), 3);

    // keys[0] was evicted from memory but is still pending for the store
    let again = service.get_tile(keys[0]).await.unwrap();
    assert_eq!(again, first[0]);
    assert_eq!(service.engine().renders(), 3);
}

// =============================================================================
// Persistent Store
// =============================================================================

#[tokio::test]
async fn test_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    let first = test_service(StubEngine::new(), Some(open_store(dir.path())));
    let router = test_router(first.clone());
    let response = get(&router, "/9/300/200.webp").await;
    assert_eq!(response.status(), StatusCode::OK);
    let etag = response.headers().get(header::ETAG).cloned().unwrap();
    let last_modified = response.headers().get(header::LAST_MODIFIED).cloned().unwrap();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    first.flush_and_dispose().unwrap();
    assert!(first.engine().is_disposed());

    let second = test_service(StubEngine::new(), Some(open_store(dir.path())));
    assert_eq!(second.store().unwrap().len(), 1);

    let router = test_router(second.clone());
    let response = get(&router, "/9/300/200.webp").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get(header::ETAG).unwrap(), &etag);
    assert_eq!(response.headers().get(header::LAST_MODIFIED).unwrap(), &last_modified);
    assert_eq!(response.into_body().collect().await.unwrap().to_bytes(), body);
    assert_eq!(second.engine().renders(), 0);
}

#[tokio::test]
async fn test_flush_persists_memory_contents() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    let service = test_service(StubEngine::new(), Some(store.clone()));

    let keys = [
        TileKey::new(3, 1, 1, ImageFormat::Png),
        TileKey::new(3, 1, 1, ImageFormat::Webp),
        TileKey::new(3, 2, 1, ImageFormat::Png),
    ];
    for key in keys {
        service.get_tile(key).await.unwrap();
    }
    service.get_tile(TileKey::new(3, 1, 1, ImageFormat::Vector)).await.unwrap();

    service.flush_and_dispose().unwrap();

    assert!(store.is_closed());
    assert_eq!(store.len(), 3);
    for key in keys {
        assert!(tile_path(dir.path(), &key).is_file(), "{} not on disk", key);
    }
    assert!(!dir.path().join("3/1/1.v").exists());
}

#[tokio::test]
async fn test_store_closed_after_flush() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    let service = test_service(StubEngine::new(), Some(store.clone()));

    service.flush_and_dispose().unwrap();
    assert!(service.flush_and_dispose().is_err());

    // Rendering still works, the result just is not persisted
    service.get_tile(TileKey::new(1, 1, 1, ImageFormat::Png)).await.unwrap();
    assert_eq!(store.pending_len(), 0);
}

#[tokio::test]
async fn test_store_budget_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let weight = stub_tile_weight().await;
    let config = StoreConfig::new(dir.path(), weight * 3).with_batch(usize::MAX, 1);
    let store = Arc::new(PersistentTileStore::open(config).unwrap());
    let service = test_service(StubEngine::new(), Some(store.clone()));

    for x in 0..8 {
        service.get_tile(TileKey::new(3, x, 0, ImageFormat::Png)).await.unwrap();
    }
    service.flush_and_dispose().unwrap();

    assert!(store.total_bytes() <= weight * 3);
    assert!(store.len() < 8);
}
