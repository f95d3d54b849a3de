//! Router configuration for the map tile server.
//!
//! This module defines the HTTP routes and applies middleware for CORS and
//! request tracing.
//!
//! # Route Structure
//!
//! ```text
//! /health                      - Health check
//! /{zoom}/{x}/{y}[.{ext}]      - Tile endpoint (non-tile paths fall through to assets)
//! /*                           - Static assets from the theme directories
//! ```
//!
//! # Example
//!
//! ```ignore
//! use map_tile_server::server::{create_router, RouterConfig, ThemeAssets};
//!
//! let assets = Arc::new(ThemeAssets::new(&config.theme));
//! let router = create_router(tile_service, assets, RouterConfig::new());
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:6090").await?;
//! axum::serve(listener, router).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use http::header::{CONTENT_TYPE, IF_MODIFIED_SINCE, IF_NONE_MATCH};
use http::Method;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::assets::AssetResolver;
use super::handlers::{asset_handler, health_handler, tile_handler, AppState};
use crate::render::TileEngine;
use crate::tile::TileService;

// =============================================================================
// Router Configuration
// =============================================================================

/// Configuration for the HTTP router.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Whether to enable request tracing
    pub enable_tracing: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterConfig {
    /// Create a router configuration with tracing enabled.
    pub fn new() -> Self {
        Self { enable_tracing: true }
    }

    /// Enable or disable request tracing.
    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.enable_tracing = enabled;
        self
    }
}

// =============================================================================
// Router Builder
// =============================================================================

/// Create the main application router.
///
/// Tiles are consumed by browser map clients on other origins, so CORS
/// allows any origin for reads.
pub fn create_router<E: TileEngine>(
    tile_service: Arc<TileService<E>>,
    assets: Arc<dyn AssetResolver>,
    config: RouterConfig,
) -> Router {
    let app_state = AppState::new(tile_service, assets);

    // {filename} captures both "{y}" and "{y}.{ext}"
    let router = Router::new()
        .route("/health", get(health_handler::<E>))
        .route("/{zoom}/{x}/{filename}", get(tile_handler::<E>))
        .fallback(asset_handler::<E>)
        .with_state(app_state)
        .layer(build_cors_layer());

    if config.enable_tracing {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    }
}

fn build_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::HEAD, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, IF_NONE_MATCH, IF_MODIFIED_SINCE])
        .max_age(Duration::from_secs(86400))
}

// =============================================================================
// Tests
// =============================================================================
