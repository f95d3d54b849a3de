//! Coverage engine.
//!
//! A [`TileEngine`] that routes each tile to the first map file whose
//! bounding box overlaps it and paints the covered area of the tile. It is
//! the engine the server binary runs with: tiles outside every map are
//! reported as not found, fingerprints follow the covering file's identity,
//! and vector tiles describe the tile and its covering map as JSON.

use std::fmt::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use image::{Rgba, RgbaImage};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::TileError;
use crate::tile::{ImageFormat, TileCacheInfo, TileKey};

use super::engine::{TileEngine, TILE_SIZE};
use super::mapfile::MapFile;

/// Fill colour of areas covered by map data.
const LAND: Rgba<u8> = Rgba([242, 239, 233, 255]);

/// Fill colour of areas outside every map.
const OUTSIDE: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// Number of hex characters kept from the fingerprint digest.
const FINGERPRINT_LEN: usize = 32;

/// Per-worker scratch state.
pub struct CoverageContext {
    pixels: RgbaImage,
    fingerprint: String,
}

/// Vector payload for one tile.
#[derive(Debug, Serialize)]
struct VectorTile<'a> {
    zoom: u8,
    x: u32,
    y: u32,
    bounds: [f64; 4],
    map: &'a str,
    created: i64,
    cached_neighbours: Vec<[u32; 2]>,
}

/// Engine backed by map file headers.
pub struct CoverageEngine {
    maps: Vec<MapFile>,
    disposed: AtomicBool,
}

impl CoverageEngine {
    pub fn new(maps: Vec<MapFile>) -> Self {
        Self {
            maps,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn maps(&self) -> &[MapFile] {
        &self.maps
    }

    /// First map overlapping the tile.
    fn locate(&self, key: &TileKey) -> Result<&MapFile, TileError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(TileError::RenderFailure {
                message: "engine has been disposed".to_string(),
            });
        }
        let bounds = key.bounds();
        self.maps
            .iter()
            .find(|map| map.header.bounding_box.intersects(bounds))
            .ok_or_else(|| key.not_found())
    }
}

impl TileEngine for CoverageEngine {
    type Context = CoverageContext;

    fn create_context(&self) -> CoverageContext {
        CoverageContext {
            pixels: RgbaImage::new(TILE_SIZE, TILE_SIZE),
            fingerprint: String::with_capacity(128),
        }
    }

    fn render<'c>(
        &self,
        context: &'c mut CoverageContext,
        key: &TileKey,
        _cache: &dyn TileCacheInfo,
    ) -> Result<&'c RgbaImage, TileError> {
        self.locate(key)?;

        let (min_lon, _, max_lon, _) = key.bounds();
        let zoom_scale = (1u64 << key.zoom) as f64 * f64::from(TILE_SIZE);
        let lon_step = (max_lon - min_lon) / f64::from(TILE_SIZE);

        for py in 0..TILE_SIZE {
            // Web-mercator latitude at the centre of this pixel row
            let global_y = f64::from(key.y) * f64::from(TILE_SIZE) + f64::from(py) + 0.5;
            let t = std::f64::consts::PI * (1.0 - 2.0 * global_y / zoom_scale);
            let lat = t.sinh().atan().to_degrees();

            for px in 0..TILE_SIZE {
                let lon = min_lon + (f64::from(px) + 0.5) * lon_step;
                let covered = self
                    .maps
                    .iter()
                    .any(|map| map.header.bounding_box.contains(lon, lat));
                context.pixels.put_pixel(px, py, if covered { LAND } else { OUTSIDE });
            }
        }

        Ok(&context.pixels)
    }

    fn render_vector(
        &self,
        _context: &mut CoverageContext,
        key: &TileKey,
        cache: &dyn TileCacheInfo,
    ) -> Result<Bytes, TileError> {
        let map = self.locate(key)?;
        let (min_lon, min_lat, max_lon, max_lat) = key.bounds();

        let max = TileKey::max_index(key.zoom) as i64;
        let mut cached_neighbours = Vec::new();
        for dy in -1i64..=1 {
            for dx in -1i64..=1 {
                let (nx, ny) = (i64::from(key.x) + dx, i64::from(key.y) + dy);
                if (dx, dy) == (0, 0) || nx < 0 || ny < 0 || nx > max || ny > max {
                    continue;
                }
                let neighbour = TileKey::new(key.zoom, nx as u32, ny as u32, ImageFormat::Png);
                if cache.contains(&neighbour) || cache.contains(&neighbour.with_format(ImageFormat::Webp)) {
                    cached_neighbours.push([nx as u32, ny as u32]);
                }
            }
        }

        let payload = VectorTile {
            zoom: key.zoom,
            x: key.x,
            y: key.y,
            bounds: [min_lon, min_lat, max_lon, max_lat],
            map: &map.name,
            created: map.header.created_ms,
            cached_neighbours,
        };
        serde_json::to_vec(&payload)
            .map(Bytes::from)
            .map_err(|e| TileError::RenderFailure {
                message: e.to_string(),
            })
    }

    fn fingerprint(&self, context: &mut CoverageContext, key: &TileKey) -> Result<String, TileError> {
        let map = self.locate(key)?;

        let input = &mut context.fingerprint;
        input.clear();
        // Writing to a String cannot fail
        let _ = write!(
            input,
            "{}@{}:{}|{}/{}/{}.{}",
            map.name, map.header.created_ms, map.header.file_size, key.zoom, key.x, key.y, key.format
        );

        let digest = hex::encode(Sha256::digest(input.as_bytes()));
        Ok(digest[..FINGERPRINT_LEN].to_string())
    }

    fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            info!(maps = self.maps.len(), "Released map sources");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
