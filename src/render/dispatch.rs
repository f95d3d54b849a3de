//! Per-worker render dispatch.
//!
//! Each worker thread gets its own engine context, created lazily on the
//! first render performed on that thread. Contexts live in thread-local
//! storage keyed by the identity of the dispatch that created them, so they
//! are never shared and never locked.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace};

use crate::error::TileError;
use crate::tile::{now_epoch_seconds, ImageFormat, RenderedTile, TileCacheInfo, TileEncoder, TileKey};

use super::engine::TileEngine;

static NEXT_DISPATCH_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static RENDER_CONTEXTS: RefCell<HashMap<u64, Box<dyn Any>>> = RefCell::new(HashMap::new());
}

/// Runs renders on the calling thread using that thread's render context.
pub struct RendererDispatch<E: TileEngine> {
    id: u64,
    engine: Arc<E>,
    encoder: TileEncoder,
    contexts_created: AtomicUsize,
}

impl<E: TileEngine> RendererDispatch<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self {
            id: NEXT_DISPATCH_ID.fetch_add(1, Ordering::Relaxed),
            engine,
            encoder: TileEncoder::new(),
            contexts_created: AtomicUsize::new(0),
        }
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    /// Number of render contexts created so far (one per thread that rendered).
    pub fn contexts_created(&self) -> usize {
        self.contexts_created.load(Ordering::Relaxed)
    }

    /// Render `key` on the current thread.
    ///
    /// Vector keys return the engine's payload with an empty fingerprint;
    /// raster keys are encoded in the requested format and fingerprinted.
    pub fn render(&self, key: &TileKey, cache: &dyn TileCacheInfo) -> Result<RenderedTile, TileError> {
        let started = Instant::now();

        let tile = self.with_context(|context| match key.format {
            ImageFormat::Vector => {
                let payload = self.engine.render_vector(context, key, cache)?;
                Ok(RenderedTile::new(payload, now_epoch_seconds(), ""))
            }
            ImageFormat::Png | ImageFormat::Webp => {
                let fingerprint = self.engine.fingerprint(context, key)?;
                let pixels = self.engine.render(context, key, cache)?;
                let bytes = self.encoder.encode(pixels, key.format)?;
                Ok(RenderedTile::new(bytes, now_epoch_seconds(), fingerprint))
            }
        })?;

        debug!(
            tile = %key,
            bytes = tile.bytes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Rendered tile"
        );
        Ok(tile)
    }

    fn with_context<R>(&self, f: impl FnOnce(&mut E::Context) -> R) -> R {
        RENDER_CONTEXTS.with(|contexts| {
            let mut contexts = contexts.borrow_mut();
            let slot = contexts.entry(self.id).or_insert_with(|| {
                self.contexts_created.fetch_add(1, Ordering::Relaxed);
                trace!(dispatch = self.id, thread = ?std::thread::current().id(), "Creating render context");
                Box::new(self.engine.create_context())
            });
            match slot.downcast_mut::<E::Context>() {
                Some(context) => f(context),
                // Dispatch ids are never reused, so a slot only ever holds our context type
                None => unreachable!("render context slot holds a foreign context type"),
            }
        })
    }
}

impl<E: TileEngine> Drop for RendererDispatch<E> {
    fn drop(&mut self) {
        // Contexts on other threads die with those threads
        let _ = RENDER_CONTEXTS.try_with(|contexts| {
            if let Ok(mut contexts) = contexts.try_borrow_mut() {
                contexts.remove(&self.id);
            }
        });
    }
}

// =============================================================================
// Tests
// =============================================================================
