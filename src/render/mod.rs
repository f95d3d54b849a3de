//! Rendering layer.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │           RendererDispatch              │
//! │  (one context per worker thread)        │
//! └────────────────────┬────────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │           TileEngine Trait              │
//! └────────────────────┬────────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │  CoverageEngine (Mapsforge headers)     │
//! └─────────────────────────────────────────┘
//! ```

mod coverage;
mod dispatch;
mod engine;
mod mapfile;

pub use coverage::{CoverageContext, CoverageEngine};
pub use dispatch::RendererDispatch;
pub use engine::{TileEngine, TILE_SIZE};
pub use mapfile::{encode_header, BoundingBox, MapFile, MapFileHeader, MAP_FILE_MAGIC, MAP_HEADER_PREFIX_SIZE};
