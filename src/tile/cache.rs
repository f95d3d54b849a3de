//! Weighted in-memory tile cache with load-once-per-key semantics.
//!
//! The cache is bounded by the total byte weight of its entries rather than
//! by entry count. It is split into shards, each holding an LRU list and a
//! proportional slice of the weight budget, so that workers rarely contend
//! on the same lock.
//!
//! # Load-once-per-key
//!
//! A miss does not load directly. The missing key is first registered in an
//! in-flight map that holds one [`OnceCell`] per key; every concurrent caller
//! for that key awaits the same cell, so exactly one load runs and all
//! callers observe its result, success or failure. Failures are shared with
//! the waiters of that load but never inserted, so the next request retries.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::future::Future;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::trace;

use crate::error::TileError;

use super::key::{RenderedTile, TileKey};

/// Default number of shards when no worker count is supplied.
pub const DEFAULT_CONCURRENCY_LEVEL: usize = 4;

type LoadCell = Arc<OnceCell<Result<RenderedTile, TileError>>>;

// =============================================================================
// Cache Membership Capability
// =============================================================================

/// Read-only view of which tiles are currently cached.
///
/// This is the only access to the cache handed to the rendering engine.
pub trait TileCacheInfo: Send + Sync {
    /// Whether `key` is currently resident. Does not affect eviction order.
    fn contains(&self, key: &TileKey) -> bool;
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`TileCache`].
///
/// The persistent store adjusts the builder before the cache is built to
/// reserve memory for its own bookkeeping.
#[derive(Debug, Clone)]
pub struct TileCacheBuilder {
    max_weight: u64,
    concurrency_level: usize,
}

impl TileCacheBuilder {
    /// Start a builder with the given weight budget in bytes.
    pub fn new(max_weight: u64) -> Self {
        Self {
            max_weight,
            concurrency_level: DEFAULT_CONCURRENCY_LEVEL,
        }
    }

    /// Number of independently locked shards, usually the worker count.
    pub fn concurrency_level(mut self, level: usize) -> Self {
        self.concurrency_level = level.max(1);
        self
    }

    /// Remove `bytes` from the weight budget.
    pub fn reserve(mut self, bytes: u64) -> Self {
        self.max_weight = self.max_weight.saturating_sub(bytes);
        self
    }

    pub fn max_weight(&self) -> u64 {
        self.max_weight
    }

    pub fn build(self) -> TileCache {
        let shard_count = self.concurrency_level;
        let shard_budget = usize::try_from(self.max_weight / shard_count as u64).unwrap_or(usize::MAX);
        let shards = (0..shard_count)
            .map(|_| {
                Mutex::new(Shard {
                    entries: LruCache::unbounded(),
                    weight: 0,
                    max_weight: shard_budget,
                })
            })
            .collect();

        TileCache {
            shards,
            hasher: RandomState::new(),
            in_flight: Mutex::new(HashMap::new()),
            max_weight: shard_budget as u64 * shard_count as u64,
            counters: Counters::default(),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub weight: u64,
    pub capacity: u64,
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub evictions: u64,
}

// =============================================================================
// Tile Cache
// =============================================================================

struct Shard {
    entries: LruCache<TileKey, RenderedTile>,
    weight: usize,
    max_weight: usize,
}

impl Shard {
    /// Insert and evict LRU entries until under budget. Returns evicted count.
    fn insert(&mut self, key: TileKey, tile: RenderedTile) -> u64 {
        let weight = tile.weight();
        if let Some(old) = self.entries.put(key, tile) {
            self.weight = self.weight.saturating_sub(old.weight());
        }
        self.weight += weight;

        let mut evicted = 0;
        while self.weight > self.max_weight {
            match self.entries.pop_lru() {
                Some((_, old)) => {
                    self.weight = self.weight.saturating_sub(old.weight());
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }
}

/// Byte-weighted, sharded LRU cache of rendered tiles.
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use map_tile_server::tile::{ImageFormat, RenderedTile, TileCacheBuilder, TileKey};
///
/// #[tokio::main]
/// async fn main() {
///     let cache = TileCacheBuilder::new(10 * 1024 * 1024).build();
///     let key = TileKey::new(1, 0, 1, ImageFormat::Png);
///
///     let tile = cache
///         .get_or_load(key, |_| async {
///             Ok(RenderedTile::new(Bytes::from_static(b"png"), 0, "etag"))
///         })
///         .await
///         .unwrap();
///
///     assert_eq!(&tile.bytes[..], b"png");
/// }
/// ```
pub struct TileCache {
    shards: Box<[Mutex<Shard>]>,
    hasher: RandomState,
    in_flight: Mutex<HashMap<TileKey, LoadCell>>,
    max_weight: u64,
    counters: Counters,
}

impl TileCache {
    /// Return the cached tile for `key`, loading it with `load` on a miss.
    ///
    /// Concurrent callers for the same absent key share one invocation of a
    /// loader; the loaders of the other callers are dropped unused.
    pub async fn get_or_load<F, Fut>(&self, key: TileKey, load: F) -> Result<RenderedTile, TileError>
    where
        F: FnOnce(TileKey) -> Fut,
        Fut: Future<Output = Result<RenderedTile, TileError>>,
    {
        if let Some(tile) = self.lookup(&key) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(tile);
        }

        let cell = {
            let mut in_flight = self.in_flight.lock();
            // A load may have completed between the lookup and taking the lock
            if let Some(tile) = self.lookup(&key) {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(tile);
            }
            in_flight
                .entry(key)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let result = cell
            .get_or_init(|| async {
                self.counters.loads.fetch_add(1, Ordering::Relaxed);
                trace!(tile = %key, "Loading tile");
                load(key).await
            })
            .await
            .clone();

        self.complete(key, &cell, &result);
        result
    }

    /// Move a finished load from the in-flight map into the cache.
    ///
    /// Only the first caller to get here for a given cell does the work.
    fn complete(&self, key: TileKey, cell: &LoadCell, result: &Result<RenderedTile, TileError>) {
        let mut in_flight = self.in_flight.lock();
        let is_current = in_flight
            .get(&key)
            .is_some_and(|current| Arc::ptr_eq(current, cell));
        if !is_current {
            return;
        }

        if let Ok(tile) = result {
            let evicted = self.shard(&key).lock().insert(key, tile.clone());
            if evicted > 0 {
                self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
                trace!(evicted, "Evicted tiles over weight budget");
            }
        }
        in_flight.remove(&key);
    }

    fn lookup(&self, key: &TileKey) -> Option<RenderedTile> {
        self.shard(key).lock().entries.get(key).cloned()
    }

    fn shard(&self, key: &TileKey) -> &Mutex<Shard> {
        let index = self.hasher.hash_one(key) as usize % self.shards.len();
        &self.shards[index]
    }

    /// Copy of every resident entry, used for the final flush to disk.
    pub fn snapshot(&self) -> Vec<(TileKey, RenderedTile)> {
        let mut entries = Vec::new();
        for shard in self.shards.iter() {
            let shard = shard.lock();
            entries.extend(shard.entries.iter().map(|(k, v)| (*k, v.clone())));
        }
        entries
    }

    /// Number of resident tiles.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total weight of resident tiles in bytes.
    pub fn weight(&self) -> u64 {
        self.shards.iter().map(|s| s.lock().weight as u64).sum()
    }

    /// Maximum total weight in bytes.
    pub fn capacity(&self) -> u64 {
        self.max_weight
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            weight: self.weight(),
            capacity: self.capacity(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            loads: self.counters.loads.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }
}

impl TileCacheInfo for TileCache {
    fn contains(&self, key: &TileKey) -> bool {
        self.shard(key).lock().entries.contains(key)
    }
}

// =============================================================================
// Tests
// =============================================================================
