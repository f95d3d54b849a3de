//! One-file-per-tile store with a write-behind buffer.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io::Write;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use bytes::{Buf, BufMut, Bytes};
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::error::StoreError;
use crate::tile::{ImageFormat, RenderedTile, TileCacheBuilder, TileKey};

/// Magic bytes at the start of every stored tile.
pub const STORE_MAGIC: &[u8; 4] = b"MTS1";

/// Assumed average size of a stored tile, used to size the index.
pub const AVERAGE_TILE_BYTES: u64 = 8 * 1024;

/// Approximate memory cost of one index entry.
pub const INDEX_ENTRY_OVERHEAD: u64 = 48;

/// Pending bytes that trigger a background batch write.
pub const DEFAULT_BATCH_BYTES: usize = 4 * 1024 * 1024;

/// Pending entries that trigger a background batch write.
pub const DEFAULT_BATCH_ENTRIES: usize = 64;

const HEADER_LEN: usize = STORE_MAGIC.len() + 8 + 2;

/// Longest fingerprint the entry header can describe.
pub const MAX_FINGERPRINT_LEN: usize = u16::MAX as usize;

/// Suffix of files being written; leftovers are from interrupted writes.
const TEMP_SUFFIX: &str = "tmp";

// =============================================================================
// Configuration
// =============================================================================

/// Settings for [`PersistentTileStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the tile files
    pub root: PathBuf,

    /// Byte budget for all stored files
    pub max_bytes: u64,

    pub batch_bytes: usize,
    pub batch_entries: usize,
}

impl StoreConfig {
    pub fn new(root: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            root: root.into(),
            max_bytes,
            batch_bytes: DEFAULT_BATCH_BYTES,
            batch_entries: DEFAULT_BATCH_ENTRIES,
        }
    }

    /// Override the batch thresholds.
    pub fn with_batch(mut self, bytes: usize, entries: usize) -> Self {
        self.batch_bytes = bytes;
        self.batch_entries = entries.max(1);
        self
    }

    /// Memory reserved for the index of a store of this size.
    pub fn index_reserve(&self) -> u64 {
        self.max_bytes / AVERAGE_TILE_BYTES * INDEX_ENTRY_OVERHEAD
    }
}

// =============================================================================
// Entry Codec
// =============================================================================

/// Path of `key` below `root`: `<root>/<zoom>/<x>/<y>.<ext>`.
pub fn tile_path(root: &Path, key: &TileKey) -> PathBuf {
    root.join(key.zoom.to_string())
        .join(key.x.to_string())
        .join(format!("{}.{}", key.y, key.format))
}

/// Recover a key from a path relative to the store root.
fn key_from_relative(relative: &Path) -> Option<TileKey> {
    let mut parts = relative.iter().map(|p| p.to_str());
    let zoom = parts.next()??.parse().ok()?;
    let x = parts.next()??.parse().ok()?;
    let (y, ext) = parts.next()??.split_once('.')?;
    if parts.next().is_some() {
        return None;
    }

    let format = ImageFormat::from_extension(ext).filter(|f| f.is_cacheable())?;
    let key = TileKey::new(zoom, x, y.parse().ok()?, format);
    key.validate().ok().map(|_| key)
}

fn encode_entry(tile: &RenderedTile) -> Result<Vec<u8>, StoreError> {
    let fingerprint = tile.fingerprint.as_bytes();
    if fingerprint.len() > MAX_FINGERPRINT_LEN {
        return Err(StoreError::FingerprintTooLong {
            len: fingerprint.len(),
            max: MAX_FINGERPRINT_LEN,
        });
    }

    let mut out = Vec::with_capacity(HEADER_LEN + fingerprint.len() + tile.bytes.len());
    out.put_slice(STORE_MAGIC);
    out.put_i64(tile.last_modified);
    out.put_u16(fingerprint.len() as u16);
    out.put_slice(fingerprint);
    out.put_slice(&tile.bytes);
    Ok(out)
}

fn decode_entry(path: &Path, data: Vec<u8>) -> Result<RenderedTile, StoreError> {
    let corrupt = |reason: &str| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    if data.len() < HEADER_LEN || &data[..STORE_MAGIC.len()] != STORE_MAGIC {
        return Err(corrupt("missing header"));
    }

    let mut buf = &data[STORE_MAGIC.len()..];
    let last_modified = buf.get_i64();
    let fingerprint_len = buf.get_u16() as usize;
    if buf.remaining() < fingerprint_len {
        return Err(corrupt("truncated fingerprint"));
    }
    let fingerprint =
        std::str::from_utf8(&buf[..fingerprint_len]).map_err(|_| corrupt("fingerprint is not UTF-8"))?;
    if fingerprint.is_empty() {
        return Err(corrupt("empty fingerprint"));
    }

    let offset = HEADER_LEN + fingerprint_len;
    let fingerprint: Arc<str> = Arc::from(fingerprint);
    let bytes = Bytes::from(data).slice(offset..);
    Ok(RenderedTile::new(bytes, last_modified, fingerprint))
}

// =============================================================================
// Persistent Tile Store
// =============================================================================

struct Index {
    /// Stored keys and their file sizes, least recently used first
    entries: LruCache<TileKey, u64>,
    total_bytes: u64,
}

#[derive(Default)]
struct Pending {
    entries: Vec<(TileKey, RenderedTile)>,
    bytes: usize,
}

/// Disk tier of the tile cache.
///
/// Tiles handed to [`record_for_persistence`](Self::record_for_persistence)
/// are buffered and written in batches on the blocking pool. All writes go
/// through a single writer lock, so a batch and the final flush never
/// interleave.
pub struct PersistentTileStore {
    config: StoreConfig,
    index: Mutex<Index>,
    pending: Mutex<Pending>,
    writer: Mutex<()>,
    drain_scheduled: AtomicBool,
    closed: AtomicBool,
}

impl PersistentTileStore {
    /// Open the store, creating the root directory and indexing existing files.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let started = Instant::now();
        fs::create_dir_all(&config.root).map_err(|e| StoreError::io(&config.root, e))?;

        let mut files = Vec::new();
        let mut interrupted = 0;
        collect_files(&config.root, &mut files, &mut interrupted);
        if interrupted > 0 {
            info!(interrupted, "Removed partial tile files from an interrupted run");
        }
        // Oldest first, so the most recently written file ends up most recently used
        files.sort_by_key(|(_, mtime, _)| *mtime);

        let mut index = Index {
            entries: LruCache::unbounded(),
            total_bytes: 0,
        };
        for (path, _, size) in files {
            let key = path
                .strip_prefix(&config.root)
                .ok()
                .and_then(key_from_relative);
            if let Some(key) = key {
                index.entries.put(key, size);
                index.total_bytes += size;
            }
        }

        let store = Self {
            config,
            index: Mutex::new(index),
            pending: Mutex::new(Pending::default()),
            writer: Mutex::new(()),
            drain_scheduled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        };
        store.evict_over_budget();

        let index = store.index.lock();
        info!(
            dir = %store.config.root.display(),
            tiles = index.entries.len(),
            bytes = index.total_bytes,
            max_bytes = store.config.max_bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Opened tile store"
        );
        drop(index);

        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Reserve memory for this store's index from the memory cache budget.
    pub fn configure_sizing(&self, builder: TileCacheBuilder) -> TileCacheBuilder {
        let reserve = self.config.index_reserve();
        debug!(reserve, "Reserving memory for tile store index");
        builder.reserve(reserve)
    }

    /// Stored tile for `key`, if any.
    ///
    /// Read failures are logged and reported as a miss.
    pub fn lookup(&self, key: &TileKey) -> Option<RenderedTile> {
        if !key.format.is_cacheable() {
            return None;
        }

        {
            let pending = self.pending.lock();
            if let Some((_, tile)) = pending.entries.iter().rev().find(|(k, _)| k == key) {
                return Some(tile.clone());
            }
        }

        if self.index.lock().entries.get(key).is_none() {
            return None;
        }

        let path = tile_path(&self.config.root, key);
        let result = fs::read(&path)
            .map_err(|e| StoreError::io(&path, e))
            .and_then(|data| decode_entry(&path, data));

        match result {
            Ok(tile) => {
                trace!(tile = %key, "Tile store hit");
                Some(tile)
            }
            Err(e) => {
                warn!(tile = %key, error = %e, "Failed to read stored tile, treating as miss");
                let mut index = self.index.lock();
                if let Some(size) = index.entries.pop(key) {
                    index.total_bytes = index.total_bytes.saturating_sub(size);
                }
                None
            }
        }
    }

    /// Queue `tile` to be written to disk.
    ///
    /// Once the buffer passes the batch threshold a drain is scheduled on the
    /// blocking pool, or run inline when called outside a runtime.
    pub fn record_for_persistence(self: &Arc<Self>, key: TileKey, tile: RenderedTile) {
        if !key.format.is_cacheable() {
            return;
        }
        if self.closed.load(Ordering::Acquire) {
            warn!(tile = %key, "Tile store is closed, dropping tile");
            return;
        }

        let over_threshold = {
            let mut pending = self.pending.lock();
            pending.bytes += tile.bytes.len();
            pending.entries.push((key, tile));
            pending.bytes >= self.config.batch_bytes || pending.entries.len() >= self.config.batch_entries
        };

        if over_threshold && !self.drain_scheduled.swap(true, Ordering::AcqRel) {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let store = Arc::clone(self);
                    handle.spawn_blocking(move || store.drain());
                }
                Err(_) => self.drain(),
            }
        }
    }

    /// Write everything currently pending.
    fn drain(&self) {
        let _writer = self.writer.lock();
        self.drain_scheduled.store(false, Ordering::Release);
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let batch = mem::take(&mut *self.pending.lock());
        if batch.entries.is_empty() {
            return;
        }

        let started = Instant::now();
        let written = self.write_all(batch.entries);
        debug!(
            written,
            bytes = batch.bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Wrote tile batch"
        );
    }

    /// Write pending tiles and every entry of `contents` that is not on disk
    /// yet, then close the store.
    ///
    /// Returns the number of tiles written.
    pub fn flush_and_close(&self, contents: Vec<(TileKey, RenderedTile)>) -> Result<usize, StoreError> {
        let _writer = self.writer.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(StoreError::Closed);
        }

        let started = Instant::now();
        let mut entries = mem::take(&mut *self.pending.lock()).entries;
        {
            let pending: HashSet<TileKey> = entries.iter().map(|(key, _)| *key).collect();
            let index = self.index.lock();
            entries.extend(contents.into_iter().filter(|(key, _)| {
                key.format.is_cacheable() && !index.entries.contains(key) && !pending.contains(key)
            }));
        }

        let dirs = self.entry_dirs(&entries);
        let written = self.write_all(entries);
        for dir in dirs {
            if let Err(e) = sync_dir(&dir) {
                warn!(dir = %dir.display(), error = %e, "Failed to sync tile directory");
            }
        }
        info!(
            written,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Flushed tile store"
        );
        Ok(written)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of indexed tiles on disk.
    pub fn len(&self) -> usize {
        self.index.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total size of indexed files in bytes.
    pub fn total_bytes(&self) -> u64 {
        self.index.lock().total_bytes
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().entries.len()
    }

    /// Directories whose entries change when `entries` are written, from the
    /// tile directories up to the root.
    fn entry_dirs(&self, entries: &[(TileKey, RenderedTile)]) -> BTreeSet<PathBuf> {
        let root = &self.config.root;
        let mut dirs = BTreeSet::new();
        for (key, _) in entries {
            let path = tile_path(root, key);
            for dir in path.ancestors().skip(1) {
                if !dir.starts_with(root) || !dirs.insert(dir.to_path_buf()) {
                    break;
                }
            }
        }
        dirs
    }

    /// Caller must hold the writer lock.
    fn write_all(&self, entries: Vec<(TileKey, RenderedTile)>) -> usize {
        let mut written = 0;
        for (key, tile) in entries {
            match self.write_entry(&key, &tile) {
                Ok(size) => {
                    let mut index = self.index.lock();
                    if let Some(old) = index.entries.put(key, size) {
                        index.total_bytes = index.total_bytes.saturating_sub(old);
                    }
                    index.total_bytes += size;
                    written += 1;
                }
                Err(e) => warn!(tile = %key, error = %e, "Failed to persist tile"),
            }
        }
        self.evict_over_budget();
        written
    }

    fn write_entry(&self, key: &TileKey, tile: &RenderedTile) -> Result<u64, StoreError> {
        let path = tile_path(&self.config.root, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let data = encode_entry(tile)?;
        let temp_path = path.with_extension(format!("{}.{}", key.format, TEMP_SUFFIX));
        let written = fs::File::create(&temp_path).and_then(|mut file| {
            file.write_all(&data)?;
            file.sync_all()
        });
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(StoreError::io(&temp_path, e));
        }
        fs::rename(&temp_path, &path).map_err(|e| StoreError::io(&path, e))?;

        Ok(data.len() as u64)
    }

    fn evict_over_budget(&self) {
        let mut index = self.index.lock();
        let mut evicted = 0u64;
        while index.total_bytes > self.config.max_bytes {
            let Some((key, size)) = index.entries.pop_lru() else {
                break;
            };
            index.total_bytes = index.total_bytes.saturating_sub(size);
            let path = tile_path(&self.config.root, &key);
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to delete evicted tile");
                }
            }
            evicted += 1;
        }
        if evicted > 0 {
            debug!(evicted, total_bytes = index.total_bytes, "Evicted stored tiles over budget");
        }
    }
}

/// Make directory entry changes (new files, renames) durable.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Recursively collect files with their mtime and size, deleting leftover
/// temporary files on the way.
fn collect_files(dir: &Path, files: &mut Vec<(PathBuf, SystemTime, u64)>, interrupted: &mut usize) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "Failed to read directory during store scan");
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, files, interrupted);
        } else if path.extension().is_some_and(|ext| ext == TEMP_SUFFIX) {
            match fs::remove_file(&path) {
                Ok(()) => {
                    trace!(path = %path.display(), "Removed partial tile file");
                    *interrupted += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial tile file"),
            }
        } else if let Ok(metadata) = entry.metadata() {
            let mtime = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            files.push((path, mtime, metadata.len()));
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
