//! Tile identity and rendered tile values.
//!
//! A [`TileKey`] is the exact cache identity of a requested tile: the
//! slippy-map coordinate plus the requested image format. A
//! [`RenderedTile`] is the immutable result of computing that key.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::TileError;

/// Fixed per-entry overhead added to the byte length of every cached tile.
pub const TILE_ENTRY_OVERHEAD: usize = 64;

/// Highest zoom level whose tile indices fit in a `u32`.
pub const MAX_ZOOM: u8 = 31;

// =============================================================================
// Image Format
// =============================================================================

/// Output format of a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Png,
    Webp,
    /// Live vector payload, never cached
    Vector,
}

impl ImageFormat {
    /// Map a path extension (`png`, `webp`, `v`) to a format.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "png" => Some(ImageFormat::Png),
            "webp" => Some(ImageFormat::Webp),
            "v" => Some(ImageFormat::Vector),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Webp => "webp",
            ImageFormat::Vector => "v",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Webp => "image/webp",
            ImageFormat::Vector => "application/json",
        }
    }

    /// Whether results of this format may be held by the cache tiers.
    pub fn is_cacheable(self) -> bool {
        !matches!(self, ImageFormat::Vector)
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

// =============================================================================
// Tile Key
// =============================================================================

/// Identity of a requested tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileKey {
    /// Zoom level (0 = whole world in one tile)
    pub zoom: u8,

    /// Tile column, 0-indexed from the antimeridian
    pub x: u32,

    /// Tile row, 0-indexed from the north
    pub y: u32,

    /// Requested output format
    pub format: ImageFormat,
}

impl TileKey {
    pub fn new(zoom: u8, x: u32, y: u32, format: ImageFormat) -> Self {
        Self { zoom, x, y, format }
    }

    /// Largest valid tile index at `zoom`, i.e. `2^zoom - 1`.
    pub fn max_index(zoom: u8) -> u64 {
        (1u64 << zoom.min(63)) - 1
    }

    /// Check `0 <= x, y <= 2^zoom - 1`.
    pub fn validate(&self) -> Result<(), TileError> {
        let max = Self::max_index(self.zoom);
        if self.zoom > MAX_ZOOM || u64::from(self.x) > max || u64::from(self.y) > max {
            return Err(TileError::OutOfRange {
                zoom: self.zoom,
                x: self.x,
                y: self.y,
                max,
            });
        }
        Ok(())
    }

    /// The same coordinate in another format.
    pub fn with_format(&self, format: ImageFormat) -> Self {
        Self { format, ..*self }
    }

    pub fn not_found(&self) -> TileError {
        TileError::NotFound {
            zoom: self.zoom,
            x: self.x,
            y: self.y,
        }
    }

    /// Geographic bounds of this tile in degrees: `(min_lon, min_lat, max_lon, max_lat)`.
    pub fn bounds(&self) -> (f64, f64, f64, f64) {
        let n = (1u64 << self.zoom) as f64;
        let lon = |x: f64| x / n * 360.0 - 180.0;
        let lat = |y: f64| {
            let t = std::f64::consts::PI * (1.0 - 2.0 * y / n);
            t.sinh().atan().to_degrees()
        };
        let x = f64::from(self.x);
        let y = f64::from(self.y);
        (lon(x), lat(y + 1.0), lon(x + 1.0), lat(y))
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}.{}", self.zoom, self.x, self.y, self.format)
    }
}

// =============================================================================
// Rendered Tile
// =============================================================================

/// The computed result for a tile key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedTile {
    /// Encoded image (or vector payload) bytes
    pub bytes: Bytes,

    /// Modification time in whole seconds since the Unix epoch
    pub last_modified: i64,

    /// Content fingerprint, empty for vector payloads
    pub fingerprint: Arc<str>,
}

impl RenderedTile {
    pub fn new(bytes: Bytes, last_modified: i64, fingerprint: impl Into<Arc<str>>) -> Self {
        Self {
            bytes,
            last_modified,
            fingerprint: fingerprint.into(),
        }
    }

    /// Capacity cost of this tile in the memory cache.
    pub fn weight(&self) -> usize {
        TILE_ENTRY_OVERHEAD + self.bytes.len()
    }

    /// Quoted fingerprint as sent in the `ETag` header.
    pub fn etag(&self) -> String {
        format!("\"{}\"", self.fingerprint)
    }
}

/// Current time truncated to whole seconds.
pub fn now_epoch_seconds() -> i64 {
    chrono::Utc::now().timestamp()
}

// =============================================================================
// Tests
// =============================================================================
