//! Configuration management for the map tile server.
//!
//! Settings come from command-line arguments via clap, with environment
//! variable fallbacks using the `MTS_` prefix and defaults for everything
//! except the map paths.
//!
//! # Example
//!
//! ```ignore
//! use map_tile_server::config::Config;
//!
//! let config = Config::parse();
//! config.validate()?;
//! println!("Listening on {}", config.bind_address());
//! ```
//!
//! # Environment Variables
//!
//! - `MTS_THEME` - Theme files, comma-separated
//! - `MTS_HOST` - Server bind address (default: 127.0.0.1)
//! - `MTS_PORT` - Server port (default: 6090)
//! - `MTS_WORKERS` - Worker threads (default: available parallelism)
//! - `MTS_MEMORY_LIMIT` - Memory available to the process in bytes
//!   (default: detected available system memory)
//! - `MTS_MAX_MEMORY_CACHE` - Memory tile cache budget in bytes
//! - `MAX_FILE_CACHE_SIZE` - Disk tile cache budget in GiB (default: 30, 0 disables)
//! - `MTS_CACHE_DIR` - Disk tile cache directory
//! - `MTS_SHUTDOWN_GRACE` - Seconds open connections get to finish on shutdown (default: 10)

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;

use crate::error::{ConfigError, StartupError};
use crate::store::StoreConfig;

// =============================================================================
// Default Values
// =============================================================================

/// Default server host.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default server port.
pub const DEFAULT_PORT: u16 = 6090;

/// Memory limit used when the system memory cannot be detected (1 GiB).
pub const DEFAULT_MEMORY_LIMIT: u64 = 1024 * 1024 * 1024;

/// Memory kept back from the tile cache for everything else (64 MiB).
pub const MEMORY_RESERVE: u64 = 64 * 1024 * 1024;

/// Default disk tile cache budget in GiB.
pub const DEFAULT_FILE_CACHE_GIB: f64 = 30.0;

/// Directory name used under the user cache directory.
pub const CACHE_DIR_NAME: &str = "map-tile-server";

/// File extension of map data files found in directories.
pub const MAP_EXTENSION: &str = "map";

/// Default drain grace period in seconds.
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Map Tile Server - renders slippy-map tiles from offline map files.
///
/// Tiles are served at `/{zoom}/{x}/{y}[.png|.webp|.v]` and cached in memory
/// and on disk.
#[derive(Parser, Debug, Clone)]
#[command(name = "map-tile-server")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Map files, or directories containing `*.map` files.
    #[arg(required = true)]
    pub maps: Vec<PathBuf>,

    /// Theme files. Their directories are also served as static assets.
    #[arg(long, env = "MTS_THEME", value_delimiter = ',')]
    pub theme: Vec<PathBuf>,

    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Host address to bind the server to.
    #[arg(long, default_value = DEFAULT_HOST, env = "MTS_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "MTS_PORT")]
    pub port: u16,

    /// Number of worker threads.
    #[arg(long, env = "MTS_WORKERS")]
    pub workers: Option<usize>,

    // =========================================================================
    // Cache Configuration
    // =========================================================================
    /// Memory available to the server, in bytes.
    ///
    /// Defaults to the system's available memory.
    #[arg(long, env = "MTS_MEMORY_LIMIT")]
    pub memory_limit: Option<u64>,

    /// Memory tile cache budget in bytes.
    ///
    /// Defaults to the memory limit minus 64 MiB.
    #[arg(long, env = "MTS_MAX_MEMORY_CACHE")]
    pub max_memory_cache: Option<u64>,

    /// Disk tile cache budget in GiB. 0 disables the disk cache.
    #[arg(long, default_value_t = DEFAULT_FILE_CACHE_GIB, env = "MAX_FILE_CACHE_SIZE")]
    pub max_file_cache_size: f64,

    /// Disk tile cache directory.
    #[arg(long, env = "MTS_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Seconds open connections get to finish on shutdown before they are
    /// force-closed.
    #[arg(long, default_value_t = DEFAULT_SHUTDOWN_GRACE_SECS, env = "MTS_SHUTDOWN_GRACE")]
    pub shutdown_grace: u64,

    // =========================================================================
    // Logging Configuration
    // =========================================================================
    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    /// Disable request tracing.
    #[arg(long, default_value_t = false)]
    pub no_tracing: bool,
}

impl Config {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.maps.is_empty() {
            return Err(ConfigError("At least one map path is required".to_string()));
        }

        if self.host.is_empty() {
            return Err(ConfigError("host must not be empty".to_string()));
        }

        if self.workers == Some(0) {
            return Err(ConfigError("workers must be greater than 0".to_string()));
        }

        if !self.max_file_cache_size.is_finite() || self.max_file_cache_size < 0.0 {
            return Err(ConfigError(format!(
                "max_file_cache_size must be a non-negative number of GiB, got {}",
                self.max_file_cache_size
            )));
        }

        if self.max_memory_cache == Some(0) {
            return Err(ConfigError("max_memory_cache must be greater than 0".to_string()));
        }

        Ok(())
    }

    /// Get the server bind address as "host:port".
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Worker thread count, defaulting to the available parallelism.
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    /// Memory available to the server: the configured limit, else the
    /// detected available system memory.
    pub fn memory_limit(&self) -> u64 {
        self.memory_limit.unwrap_or_else(detect_available_memory)
    }

    /// Byte budget of the memory tile cache before any store reserve.
    pub fn memory_cache_budget(&self) -> Result<u64, StartupError> {
        if let Some(budget) = self.max_memory_cache {
            return Ok(budget);
        }
        let limit = self.memory_limit();
        match limit.checked_sub(MEMORY_RESERVE) {
            Some(budget) if budget > 0 => Ok(budget),
            _ => Err(StartupError::InsufficientMemory {
                limit,
                reserve: MEMORY_RESERVE,
            }),
        }
    }

    /// Drain grace period for shutdown.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace)
    }

    /// Byte budget of the disk tile cache.
    pub fn file_cache_bytes(&self) -> u64 {
        (self.max_file_cache_size * GIB) as u64
    }

    /// Disk tile cache directory, defaulting to the user cache directory.
    pub fn cache_directory(&self) -> PathBuf {
        match &self.cache_dir {
            Some(dir) => dir.clone(),
            None => dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(CACHE_DIR_NAME),
        }
    }

    /// Disk store settings, or `None` when the disk cache is disabled.
    pub fn store_config(&self) -> Option<StoreConfig> {
        match self.file_cache_bytes() {
            0 => None,
            bytes => Some(StoreConfig::new(self.cache_directory(), bytes)),
        }
    }

    /// Expand the configured map paths.
    ///
    /// Directories contribute their `*.map` files in name order; plain paths
    /// are taken as given.
    pub fn map_paths(&self) -> Result<Vec<PathBuf>, StartupError> {
        let mut paths = Vec::new();
        for path in &self.maps {
            if path.is_dir() {
                paths.extend(map_files_in(path)?);
            } else {
                paths.push(path.clone());
            }
        }

        if paths.is_empty() {
            return Err(StartupError::NoMaps);
        }
        Ok(paths)
    }
}

// =============================================================================
// Memory Detection
// =============================================================================

/// Detect the memory available to new allocations, in bytes.
///
/// # Platform Support
///
/// - **Linux**: `MemAvailable` from `/proc/meminfo`, else `MemTotal`
/// - **Other platforms**: [`DEFAULT_MEMORY_LIMIT`]
#[cfg(target_os = "linux")]
pub fn detect_available_memory() -> u64 {
    fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|content| parse_meminfo(&content))
        .unwrap_or(DEFAULT_MEMORY_LIMIT)
}

#[cfg(not(target_os = "linux"))]
pub fn detect_available_memory() -> u64 {
    DEFAULT_MEMORY_LIMIT
}

/// Available memory in bytes from `/proc/meminfo` content.
///
/// Lines look like `MemAvailable:    8123456 kB`.
pub fn parse_meminfo(content: &str) -> Option<u64> {
    let field = |name: &str| {
        content.lines().find_map(|line| {
            let value = line.strip_prefix(name)?.strip_prefix(':')?;
            let kb = value.split_whitespace().next()?.parse::<u64>().ok()?;
            Some(kb.saturating_mul(1024))
        })
    };
    field("MemAvailable").or_else(|| field("MemTotal"))
}

fn map_files_in(dir: &Path) -> Result<Vec<PathBuf>, StartupError> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_map = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(MAP_EXTENSION));
        if is_map && path.is_file() {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

// =============================================================================
// Tests
// =============================================================================
