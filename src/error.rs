use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while resolving, rendering or encoding a tile.
///
/// This type is `Clone` because a single failed load is handed to every
/// request that was waiting on it.
#[derive(Debug, Clone, Error)]
pub enum TileError {
    /// No map data covers the requested coordinate (HTTP 404)
    #[error("No map data covers tile {zoom}/{x}/{y}")]
    NotFound { zoom: u8, x: u32, y: u32 },

    /// Coordinate exceeds the valid index for its zoom level (HTTP 400)
    #[error("Tile coordinates ({x}, {y}) are out of range for zoom {zoom} (max index: {max})")]
    OutOfRange { zoom: u8, x: u32, y: u32, max: u64 },

    /// The engine failed to decode or rasterize map data (HTTP 500)
    #[error("Render failure: {message}")]
    RenderFailure { message: String },

    /// The rendered pixels could not be encoded (HTTP 500)
    #[error("Failed to encode {format} tile: {message}")]
    EncodeFailure {
        format: &'static str,
        message: String,
    },
}

impl TileError {
    /// Whether this error means "no backing data" rather than an internal fault.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TileError::NotFound { .. })
    }
}

/// Errors raised by the persistent tile store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying filesystem error
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A stored entry could not be decoded
    #[error("Corrupt cache entry {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// A tile fingerprint does not fit the entry header
    #[error("Fingerprint of {len} bytes exceeds the {max} byte limit")]
    FingerprintTooLong { len: usize, max: usize },

    /// The store has already been flushed and closed
    #[error("Tile store is closed")]
    Closed,
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// An invalid command-line or environment setting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ConfigError(pub String);

/// Errors that prevent the server from starting.
#[derive(Debug, Error)]
pub enum StartupError {
    /// Configuration values are invalid
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// None of the supplied paths contained map data
    #[error("No map specified")]
    NoMaps,

    /// A map file header could not be read
    #[error("Cannot read map file {path}: {reason}")]
    InvalidMap { path: PathBuf, reason: String },

    /// Not enough memory left for the tile cache
    #[error("Memory not enough: limit {limit} bytes, reserve {reserve} bytes")]
    InsufficientMemory { limit: u64, reserve: u64 },

    /// The persistent store could not be opened
    #[error("Cannot open tile store: {0}")]
    Store(#[from] StoreError),

    /// The listener could not be bound or the runtime could not start
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of a single shutdown action.
#[derive(Debug, Error)]
pub enum ShutdownError {
    /// The action returned an error
    #[error("Shutdown action '{action}' failed: {message}")]
    Failed {
        action: &'static str,
        message: String,
    },

    /// The action panicked
    #[error("Shutdown action '{action}' panicked: {message}")]
    Panicked {
        action: &'static str,
        message: String,
    },

    /// The action was already executed
    #[error("Shutdown action '{0}' already ran")]
    AlreadyRan(&'static str),
}
