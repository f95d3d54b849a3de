//! Mapsforge map file headers.
//!
//! Only the fixed-size prefix of the header is read: it carries everything
//! the server needs to route a tile to a file (the bounding box) and to
//! fingerprint rendered tiles (creation date and file size).
//!
//! # Header Layout (big endian)
//!
//! ```text
//! offset  size  field
//! 0       20    magic "mapsforge binary OSM"
//! 20      4     remaining header size
//! 24      4     file format version
//! 28      8     file size
//! 36      8     creation date, ms since epoch
//! 44      16    bounding box: min lat, min lon, max lat, max lon (microdegrees)
//! 60      2     tile size in pixels
//! ```

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use bytes::Buf;

use crate::error::StartupError;

/// Magic bytes at the start of every Mapsforge map file.
pub const MAP_FILE_MAGIC: &[u8; 20] = b"mapsforge binary OSM";

/// Size of the fixed header prefix that is parsed.
pub const MAP_HEADER_PREFIX_SIZE: usize = 62;

/// Geographic bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    /// Whether the box overlaps `(min_lon, min_lat, max_lon, max_lat)`.
    pub fn intersects(&self, bounds: (f64, f64, f64, f64)) -> bool {
        let (min_lon, min_lat, max_lon, max_lat) = bounds;
        self.min_lon < max_lon && min_lon < self.max_lon && self.min_lat < max_lat && min_lat < self.max_lat
    }

    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        lon >= self.min_lon && lon <= self.max_lon && lat >= self.min_lat && lat <= self.max_lat
    }
}

/// Parsed prefix of a map file header.
#[derive(Debug, Clone, PartialEq)]
pub struct MapFileHeader {
    pub version: u32,
    pub file_size: u64,
    /// Creation date in milliseconds since the Unix epoch
    pub created_ms: i64,
    pub bounding_box: BoundingBox,
    pub tile_size: u16,
}

impl MapFileHeader {
    /// Parse the header prefix from raw bytes.
    pub fn parse(data: &[u8]) -> Result<Self, String> {
        if data.len() < MAP_HEADER_PREFIX_SIZE {
            return Err(format!(
                "header too short: need {} bytes, got {}",
                MAP_HEADER_PREFIX_SIZE,
                data.len()
            ));
        }
        if &data[..MAP_FILE_MAGIC.len()] != MAP_FILE_MAGIC {
            return Err("not a mapsforge map file (bad magic)".to_string());
        }

        let mut buf = &data[MAP_FILE_MAGIC.len()..];
        let _header_size = buf.get_u32();
        let version = buf.get_u32();
        let file_size = buf.get_u64();
        let created_ms = buf.get_i64();
        let micro = |v: i32| f64::from(v) / 1_000_000.0;
        let bounding_box = BoundingBox {
            min_lat: micro(buf.get_i32()),
            min_lon: micro(buf.get_i32()),
            max_lat: micro(buf.get_i32()),
            max_lon: micro(buf.get_i32()),
        };
        let tile_size = buf.get_u16();

        if bounding_box.min_lat > bounding_box.max_lat || bounding_box.min_lon > bounding_box.max_lon {
            return Err("invalid bounding box".to_string());
        }

        Ok(Self {
            version,
            file_size,
            created_ms,
            bounding_box,
            tile_size,
        })
    }
}

/// A map file known to the server.
#[derive(Debug, Clone)]
pub struct MapFile {
    pub path: PathBuf,
    /// File stem, used in fingerprints and vector payloads
    pub name: String,
    pub header: MapFileHeader,
}

impl MapFile {
    /// Open `path` and read its header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StartupError> {
        let path = path.as_ref();
        let invalid = |reason: String| StartupError::InvalidMap {
            path: path.to_path_buf(),
            reason,
        };

        let mut prefix = [0u8; MAP_HEADER_PREFIX_SIZE];
        File::open(path)
            .and_then(|mut file| file.read_exact(&mut prefix))
            .map_err(|e| invalid(e.to_string()))?;
        let header = MapFileHeader::parse(&prefix).map_err(invalid)?;

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self {
            path: path.to_path_buf(),
            name,
            header,
        })
    }
}

/// Build a header prefix, used by tests and fixtures.
pub fn encode_header(header: &MapFileHeader) -> Vec<u8> {
    use bytes::BufMut;

    let micro = |v: f64| (v * 1_000_000.0).round() as i32;
    let mut out = Vec::with_capacity(MAP_HEADER_PREFIX_SIZE);
    out.put_slice(MAP_FILE_MAGIC);
    out.put_u32(0);
    out.put_u32(header.version);
    out.put_u64(header.file_size);
    out.put_i64(header.created_ms);
    out.put_i32(micro(header.bounding_box.min_lat));
    out.put_i32(micro(header.bounding_box.min_lon));
    out.put_i32(micro(header.bounding_box.max_lat));
    out.put_i32(micro(header.bounding_box.max_lon));
    out.put_u16(header.tile_size);
    out
}

// =============================================================================
// Tests
// =============================================================================
