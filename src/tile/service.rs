//! Tile Service for orchestrating tile generation.
//!
//! The TileService is the main entry point for tile requests. It orchestrates:
//! - Key validation
//! - Memory cache lookups with load-once-per-key semantics
//! - Persistent store lookups on a memory miss
//! - Rendering through the per-worker dispatch
//! - Handing new tiles to the store for persistence
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          TileService                             │
//! │  ┌────────────────────────────────────────────────────────────┐  │
//! │  │                       get_tile()                           │  │
//! │  │  1. Validate key      3. Look up store on miss             │  │
//! │  │  2. Check cache       4. Render, record & return           │  │
//! │  └────────────────────────────────────────────────────────────┘  │
//! │          │                      │                      │         │
//! │          ▼                      ▼                      ▼         │
//! │    ┌───────────┐     ┌─────────────────────┐  ┌────────────────┐ │
//! │    │ TileCache │     │ PersistentTileStore │  │RendererDispatch│ │
//! │    └───────────┘     └─────────────────────┘  └────────────────┘ │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Vector tiles skip both cache tiers and are rendered on every request.

use std::sync::Arc;

use tracing::debug;

use crate::error::{StoreError, TileError};
use crate::render::{RendererDispatch, TileEngine};
use crate::store::PersistentTileStore;

use super::cache::{CacheStats, TileCache};
use super::key::{RenderedTile, TileKey};

/// Service for generating and caching tiles.
///
/// # Type Parameters
///
/// * `E` - The rendering engine
///
/// # Example
///
/// ```ignore
/// use map_tile_server::tile::{ImageFormat, TileCacheBuilder, TileKey, TileService};
///
/// let cache = TileCacheBuilder::new(256 * 1024 * 1024).build();
/// let service = TileService::new(Arc::new(engine), cache, None);
///
/// let tile = service.get_tile(TileKey::new(12, 2200, 1343, ImageFormat::Png)).await?;
/// println!("Tile size: {} bytes, etag: {}", tile.bytes.len(), tile.etag());
/// ```
pub struct TileService<E: TileEngine> {
    /// Memory tier
    cache: Arc<TileCache>,

    /// Disk tier, absent when disabled
    store: Option<Arc<PersistentTileStore>>,

    dispatch: RendererDispatch<E>,
}

impl<E: TileEngine> TileService<E> {
    pub fn new(engine: Arc<E>, cache: TileCache, store: Option<Arc<PersistentTileStore>>) -> Self {
        Self {
            cache: Arc::new(cache),
            store,
            dispatch: RendererDispatch::new(engine),
        }
    }

    /// Get a tile, using the cache tiers when the format allows it.
    ///
    /// # Errors
    ///
    /// - [`TileError::OutOfRange`] if the coordinate is invalid for its zoom
    /// - [`TileError::NotFound`] if no map data covers the tile
    /// - [`TileError::RenderFailure`] / [`TileError::EncodeFailure`] on engine faults
    pub async fn get_tile(&self, key: TileKey) -> Result<RenderedTile, TileError> {
        key.validate()?;

        if !key.format.is_cacheable() {
            return self.dispatch.render(&key, self.cache.as_ref());
        }

        self.cache
            .get_or_load(key, |key| async move { self.load(key) })
            .await
    }

    /// Cache load function: store first, then render.
    fn load(&self, key: TileKey) -> Result<RenderedTile, TileError> {
        if let Some(store) = &self.store {
            if let Some(tile) = store.lookup(&key) {
                debug!(tile = %key, "Loaded tile from store");
                return Ok(tile);
            }
        }

        let tile = self.dispatch.render(&key, self.cache.as_ref())?;

        if let Some(store) = &self.store {
            store.record_for_persistence(key, tile.clone());
        }
        Ok(tile)
    }

    /// Flush the memory contents to the store, then release the engine.
    ///
    /// The engine is released even when the flush fails.
    pub fn flush_and_dispose(&self) -> Result<(), StoreError> {
        let flushed = match &self.store {
            Some(store) => store.flush_and_close(self.cache.snapshot()).map(|_| ()),
            None => Ok(()),
        };
        self.dispatch.engine().dispose();
        flushed
    }

    pub fn cache(&self) -> &Arc<TileCache> {
        &self.cache
    }

    pub fn store(&self) -> Option<&Arc<PersistentTileStore>> {
        self.store.as_ref()
    }

    pub fn engine(&self) -> &Arc<E> {
        self.dispatch.engine()
    }

    pub fn dispatch(&self) -> &RendererDispatch<E> {
        &self.dispatch
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

// =============================================================================
// Tests
// =============================================================================
