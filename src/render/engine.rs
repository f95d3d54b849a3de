//! TileEngine trait for the map rasterization backend.
//!
//! The engine is the component that actually understands map data. The tile
//! server only needs three things from it: pixels for a raster tile, a live
//! payload for a vector tile, and a fingerprint that changes only when the
//! underlying map data changes.

use bytes::Bytes;
use image::RgbaImage;

use crate::error::TileError;
use crate::tile::{TileCacheInfo, TileKey};

/// Side length of a rendered tile in pixels.
pub const TILE_SIZE: u32 = 256;

/// Map rendering backend.
///
/// Every method receives the calling worker's own render context, so
/// implementations may keep scratch buffers there without synchronization.
/// A context is created once per worker thread and reused for the lifetime
/// of that thread.
///
/// All methods return [`TileError::NotFound`] when no map source covers the
/// requested coordinate.
pub trait TileEngine: Send + Sync + 'static {
    /// Per-worker scratch state.
    type Context: 'static;

    /// Create a fresh render context for a worker thread.
    fn create_context(&self) -> Self::Context;

    /// Rasterize `key` into the context's pixel buffer.
    ///
    /// `cache` answers whether other tiles are already cached; engines use it
    /// to decide whether content overlapping a neighbour needs to be drawn.
    fn render<'c>(
        &self,
        context: &'c mut Self::Context,
        key: &TileKey,
        cache: &dyn TileCacheInfo,
    ) -> Result<&'c RgbaImage, TileError>;

    /// Produce the live vector payload for `key`.
    fn render_vector(
        &self,
        context: &mut Self::Context,
        key: &TileKey,
        cache: &dyn TileCacheInfo,
    ) -> Result<Bytes, TileError>;

    /// Content fingerprint for `key`, stable across renders of the same data.
    fn fingerprint(&self, context: &mut Self::Context, key: &TileKey) -> Result<String, TileError>;

    /// Release engine-held resources. Called once during shutdown.
    fn dispose(&self) {}
}
