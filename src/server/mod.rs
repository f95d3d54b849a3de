//! HTTP server layer for the map tile server.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         HTTP Layer                              │
//! │                GET /{zoom}/{x}/{y}[.{ext}]                      │
//! │                                                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐  │
//! │  │  handlers   │  │   assets    │  │        routes           │  │
//! │  │ (requests)  │  │ (themes)    │  │  (router config)        │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘  │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │             registry (listener + connections)             │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod assets;
pub mod handlers;
pub mod registry;
pub mod routes;

pub use assets::{content_type_for, Asset, AssetResolver, ThemeAssets};
pub use handlers::{
    asset_handler, format_http_date, health_handler, negotiate, parse_http_date, tile_handler, AppState,
    ErrorResponse, HealthResponse, TilePathParams, TileQueryParams, TileRequest, TILE_CACHE_CONTROL,
};
pub use registry::{ConnectionRegistry, RegisteredListener, TrackedStream};
pub use routes::{create_router, RouterConfig};
