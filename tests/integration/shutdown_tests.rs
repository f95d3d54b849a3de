//! Connection tracking and shutdown integration tests.
//!
//! Tests verify:
//! - Accepted connections are counted while open
//! - Closing the registry stops the listener and drains keep-alive connections
//! - Connections stuck mid-request are force-closed after the grace period
//! - The full shutdown sequence flushes the store and stops the worker pool

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use map_tile_server::error::ShutdownError;
use map_tile_server::server::ConnectionRegistry;
use map_tile_server::shutdown::{ShutdownHooks, WorkerPool};
use map_tile_server::store::{tile_path, PersistentTileStore, StoreConfig};
use map_tile_server::tile::{ImageFormat, TileKey};

use super::test_utils::{raw_get, test_router, test_service, StubEngine};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_registry_tracks_and_drains_connections() {
    let service = test_service(StubEngine::new(), None);
    let router = test_router(service);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let registry = ConnectionRegistry::new();
    let server = axum::serve(registry.listener(listener), router).with_graceful_shutdown(registry.shutdown_signal());
    registry.register_server(tokio::spawn(async move { server.await }));

    let mut client = TcpStream::connect(addr).await.unwrap();
    let response = raw_get(&mut client, "/health").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("healthy"));

    let response = raw_get(&mut client, "/2/1/1.png").await;
    assert!(response.starts_with("HTTP/1.1 200"));

    assert_eq!(registry.active_connections(), 1);
    assert_eq!(registry.total_connections(), 1);

    // The client keeps its idle keep-alive connection open
    tokio::time::timeout(Duration::from_secs(10), registry.close_and_wait())
        .await
        .expect("connections should drain");

    assert!(registry.is_closed());
    assert_eq!(registry.active_connections(), 0);
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_half_sent_request_is_force_closed_after_grace() {
    let service = test_service(StubEngine::new(), None);
    let router = test_router(service);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let registry = ConnectionRegistry::with_grace(Duration::from_millis(200));
    let server = axum::serve(registry.listener(listener), router).with_graceful_shutdown(registry.shutdown_signal());
    registry.register_server(tokio::spawn(async move { server.await }));

    // Headers without the terminating blank line
    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"GET /0/0/0.png HTTP/1.1\r\nHost: x\r\n")
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while registry.active_connections() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection should be accepted");

    tokio::time::timeout(Duration::from_secs(10), registry.close_and_wait())
        .await
        .expect("drain should give up after the grace period");

    assert!(registry.is_closed());
    assert_eq!(registry.active_connections(), 0);

    // The server side is gone: the client sees EOF or a reset, never a response
    let mut buf = [0u8; 64];
    match tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf)).await {
        Ok(Ok(n)) => assert_eq!(n, 0, "unexpected response: {:?}", &buf[..n]),
        Ok(Err(_)) => {}
        Err(_) => panic!("client connection was left open"),
    }
}

#[tokio::test]
async fn test_close_without_server_returns_immediately() {
    let registry = ConnectionRegistry::new();
    registry.close_and_wait().await;
    registry.close_and_wait().await;
    assert!(registry.is_closed());
}

#[test]
fn test_full_shutdown_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(PersistentTileStore::open(StoreConfig::new(dir.path(), 1 << 30)).unwrap());
    let service = test_service(StubEngine::new(), Some(store.clone()));
    let router = test_router(service.clone());

    let pool = Arc::new(WorkerPool::new(2).unwrap());
    let listener = pool.block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
    let addr = listener.local_addr().unwrap();

    let registry = ConnectionRegistry::new();
    let server = axum::serve(registry.listener(listener), router).with_graceful_shutdown(registry.shutdown_signal());
    registry.register_server(pool.handle().spawn(async move { server.await }));

    let response = pool.block_on(async move {
        let mut client = TcpStream::connect(addr).await.unwrap();
        raw_get(&mut client, "/4/5/6.webp").await
    });
    assert!(response.starts_with("HTTP/1.1 200"));

    let mut hooks = ShutdownHooks::new();
    let handle = pool.handle().clone();
    let closing = registry.clone();
    hooks.add("close connections", move || {
        handle.block_on(closing.close_and_wait());
        Ok(())
    });
    let initiating = pool.clone();
    hooks.add("initiate worker shutdown", move || initiating.initiate_shutdown());
    let flushing = service.clone();
    hooks.add("flush tile store", move || {
        flushing.flush_and_dispose().map_err(|e| ShutdownError::Failed {
            action: "flush tile store",
            message: e.to_string(),
        })
    });
    let awaiting = pool.clone();
    hooks.add_last("await worker shutdown", move || awaiting.await_shutdown());

    let failures = hooks.run();
    assert!(failures.is_empty(), "unexpected failures: {:?}", failures);

    assert!(registry.is_closed());
    assert_eq!(registry.active_connections(), 0);
    assert!(store.is_closed());
    assert!(service.engine().is_disposed());
    assert!(tile_path(dir.path(), &TileKey::new(4, 5, 6, ImageFormat::Webp)).is_file());

    // A second run is a no-op
    assert!(hooks.run().is_empty());
}
