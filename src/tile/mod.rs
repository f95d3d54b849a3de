//! Tile service layer.
//!
//! This module provides tile identity, caching and encoding for serving map
//! tiles over HTTP.
//!
//! # Architecture
//!
//! The tile service sits between the HTTP layer and the rendering engine:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              HTTP Handlers              │
//! └────────────────────┬────────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │              Tile Service               │
//! │  ┌──────────────┐  ┌─────────────────┐  │
//! │  │  TileCache   │  │ Tile Store      │  │
//! │  │  (memory,    │  │ (disk, write    │  │
//! │  │   weighted)  │  │  behind)        │  │
//! │  └──────────────┘  └─────────────────┘  │
//! └────────────────────┬────────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │    RendererDispatch → TileEncoder       │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - [`TileService`]: Main entry point for tile requests
//! - [`TileCache`]: Byte-weighted LRU cache with load-once-per-key semantics
//! - [`TileKey`]: Zoom, column, row and format of a requested tile
//! - [`RenderedTile`]: Encoded bytes plus last-modified time and fingerprint
//! - [`TileEncoder`]: PNG and WebP encoding of rendered pixels
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use map_tile_server::tile::{ImageFormat, RenderedTile, TileCacheBuilder, TileCacheInfo, TileKey};
//!
//! #[tokio::main]
//! async fn main() {
//!     // Create a cache with a 50MB weight budget
//!     let cache = TileCacheBuilder::new(50 * 1024 * 1024).build();
//!
//!     let key = TileKey::new(12, 2200, 1343, ImageFormat::Png);
//!     let tile = cache
//!         .get_or_load(key, |_| async {
//!             Ok(RenderedTile::new(Bytes::from_static(b"..."), 1_700_000_000, "fp"))
//!         })
//!         .await
//!         .unwrap();
//!
//!     assert!(cache.contains(&key));
//!     assert_eq!(tile.etag(), "\"fp\"");
//! }
//! ```

mod cache;
mod encoder;
mod key;
mod service;

pub use cache::{CacheStats, TileCache, TileCacheBuilder, TileCacheInfo, DEFAULT_CONCURRENCY_LEVEL};
pub use encoder::TileEncoder;
pub use key::{now_epoch_seconds, ImageFormat, RenderedTile, TileKey, MAX_ZOOM, TILE_ENTRY_OVERHEAD};
pub use service::TileService;
