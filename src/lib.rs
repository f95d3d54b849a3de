//! # Map Tile Server
//!
//! Renders slippy-map tiles on demand from offline map files and serves
//! them over HTTP.
//!
//! Tiles are addressed as `/{zoom}/{x}/{y}[.{ext}]` in Web Mercator. Each
//! rendered raster tile is kept in a byte-bounded memory cache and in an
//! optional disk cache that survives restarts, and is served with ETag and
//! Last-Modified headers so clients revalidate cheaply.
//!
//! ## Features
//!
//! - **Load once per key**: concurrent requests for the same tile render it once
//! - **Two cache tiers**: weighted memory LRU in front of a file-per-tile disk store
//! - **Content negotiation**: PNG or WebP chosen from `Accept` when no extension is given
//! - **Conditional requests**: `If-None-Match` and `If-Modified-Since` answer 304
//! - **Graceful shutdown**: connections drain and the disk cache is flushed on SIGINT/SIGTERM
//!
//! ## Architecture
//!
//! - [`tile`] - Tile keys, memory cache, encoders and the tile service
//! - [`render`] - Render engine seam, per-thread dispatch and map files
//! - [`store`] - Persistent disk tile store
//! - [`server`] - Axum routes, handlers, assets and connection tracking
//! - [`shutdown`] - Ordered shutdown actions and the worker pool
//! - [`config`] - CLI and configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use map_tile_server::{
//!     create_router, CoverageEngine, MapFile, RouterConfig, ThemeAssets, TileCacheBuilder,
//!     TileService,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Arc::new(CoverageEngine::new(vec![MapFile::open("berlin.map")?]));
//!     let cache = TileCacheBuilder::new(256 * 1024 * 1024).build();
//!     let service = Arc::new(TileService::new(engine, cache, None));
//!
//!     let router = create_router(service, Arc::new(ThemeAssets::default()), RouterConfig::new());
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:6090").await?;
//!     axum::serve(listener, router).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod render;
pub mod server;
pub mod shutdown;
pub mod store;
pub mod tile;

// Re-export commonly used types
pub use config::Config;
pub use error::{ConfigError, ShutdownError, StartupError, StoreError, TileError};
pub use render::{BoundingBox, CoverageEngine, MapFile, MapFileHeader, RendererDispatch, TileEngine, TILE_SIZE};
pub use server::{
    create_router, health_handler, tile_handler, AppState, AssetResolver, ConnectionRegistry, ErrorResponse,
    HealthResponse, RouterConfig, ThemeAssets,
};
pub use shutdown::{ShutdownHooks, WorkerPool};
pub use store::{PersistentTileStore, StoreConfig};
pub use tile::{
    CacheStats, ImageFormat, RenderedTile, TileCache, TileCacheBuilder, TileCacheInfo, TileEncoder, TileKey,
    TileService,
};
