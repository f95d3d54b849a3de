//! Persistent tile store.
//!
//! The disk tier behind the memory cache. Rendered raster tiles are written
//! to one file per tile under the store root and survive restarts:
//!
//! ```text
//! <root>/<zoom>/<x>/<y>.<png|webp>
//! ```
//!
//! Each file holds a small header (magic, last-modified, fingerprint)
//! followed by the encoded tile. The store keeps an in-memory LRU index of
//! the files it owns and deletes the least recently used ones once its byte
//! budget is exceeded. Vector payloads are never stored.

mod disk;

pub use disk::{
    tile_path, PersistentTileStore, StoreConfig, AVERAGE_TILE_BYTES, DEFAULT_BATCH_BYTES,
    DEFAULT_BATCH_ENTRIES, INDEX_ENTRY_OVERHEAD, STORE_MAGIC,
};
