//! HTTP request handlers for the map tile API.
//!
//! This module contains the Axum handlers for serving tiles, static assets
//! and health checks.
//!
//! # Endpoints
//!
//! - `GET /{zoom}/{x}/{y}[.png|.webp|.v]` - Serve a tile
//! - `GET /health` - Health check endpoint
//! - anything else - Static asset lookup, 404 if unknown

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::TileError;
use crate::render::TileEngine;
use crate::tile::{CacheStats, ImageFormat, RenderedTile, TileKey, TileService};

use super::assets::AssetResolver;

/// `Cache-Control` sent with raster tiles.
pub const TILE_CACHE_CONTROL: &str = "public, max-age=86400";

/// IMF-fixdate, the format of `Last-Modified` and `If-Modified-Since`.
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

// =============================================================================
// Application State
// =============================================================================

/// Shared application state containing the tile service.
///
/// This is passed to all handlers via Axum's State extractor.
pub struct AppState<E: TileEngine> {
    /// The tile service for processing tile requests
    pub tile_service: Arc<TileService<E>>,

    /// Resolver for non-tile paths
    pub assets: Arc<dyn AssetResolver>,
}

impl<E: TileEngine> AppState<E> {
    pub fn new(tile_service: Arc<TileService<E>>, assets: Arc<dyn AssetResolver>) -> Self {
        Self { tile_service, assets }
    }
}

impl<E: TileEngine> Clone for AppState<E> {
    fn clone(&self) -> Self {
        Self {
            tile_service: Arc::clone(&self.tile_service),
            assets: Arc::clone(&self.assets),
        }
    }
}

// =============================================================================
// Request Parameters
// =============================================================================

/// Path parameters for tile requests.
///
/// Extracted from: `/{zoom}/{x}/{filename}` where filename is `{y}` or
/// `{y}.{ext}`. Segments are kept as strings so that paths which are not
/// tiles can fall through to the asset resolver.
#[derive(Debug, Deserialize)]
pub struct TilePathParams {
    pub zoom: String,
    pub x: String,
    pub filename: String,
}

/// A tile path resolved to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRequest {
    pub key: TileKey,

    /// The format came from the `Accept` header rather than the path
    pub negotiated: bool,
}

impl TilePathParams {
    /// Parse the path into a tile request.
    ///
    /// Returns `None` if the segments are not plain ASCII digits or the
    /// extension is unknown. Coordinates are not range checked here.
    pub fn parse(&self, accept: Option<&str>) -> Option<TileRequest> {
        let zoom = parse_digits(&self.zoom)?;
        let x = parse_digits(&self.x)?;

        let (y, format, negotiated) = match self.filename.split_once('.') {
            Some((y, ext)) => (y, ImageFormat::from_extension(ext)?, false),
            None => (self.filename.as_str(), negotiate(accept), true),
        };
        let y = parse_digits(y)?;

        Some(TileRequest {
            key: TileKey::new(zoom, x, y, format),
            negotiated,
        })
    }
}

/// Parse a path segment made only of ASCII digits.
///
/// `str::parse` also takes a leading `+`, which would give one tile two URLs.
fn parse_digits<T: std::str::FromStr>(segment: &str) -> Option<T> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    segment.parse().ok()
}

/// WebP if the client accepts it, PNG otherwise.
pub fn negotiate(accept: Option<&str>) -> ImageFormat {
    match accept {
        Some(accept) if accept.contains("image/webp") => ImageFormat::Webp,
        _ => ImageFormat::Png,
    }
}

/// Query parameters for tile requests.
#[derive(Debug, Default, Deserialize)]
pub struct TileQueryParams {
    /// Rendering theme requested by the client
    #[serde(default)]
    pub theme: Option<String>,
}

// =============================================================================
// Response Types
// =============================================================================

/// JSON error response returned for all error conditions.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error type identifier (e.g., "not_found", "out_of_range")
    pub error: String,

    /// Human-readable error message
    pub message: String,

    /// HTTP status code (included for convenience)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(error: impl Into<String>, message: impl Into<String>, status: StatusCode) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            status: Some(status.as_u16()),
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Service version
    pub version: String,

    /// Memory cache statistics
    pub cache: CacheStats,

    /// Tiles held by the persistent store, absent when disabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stored_tiles: Option<usize>,
}

// =============================================================================
// Error Mapping
// =============================================================================

/// Convert TileError to HTTP response.
///
/// This implementation logs errors appropriately based on their severity:
/// - 404 is logged at DEBUG level (tiles outside the map are routine)
/// - other 4xx errors are logged at WARN level
/// - 5xx errors are logged at ERROR level
impl IntoResponse for TileError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            TileError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            TileError::OutOfRange { .. } => (StatusCode::BAD_REQUEST, "out_of_range"),
            TileError::RenderFailure { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "render_error"),
            TileError::EncodeFailure { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "encode_error"),
        };
        let message = self.to_string();

        if status.is_server_error() {
            error!(
                error_type = error_type,
                status = status.as_u16(),
                "Server error: {}",
                message
            );
        } else if status == StatusCode::NOT_FOUND {
            debug!(
                error_type = error_type,
                status = status.as_u16(),
                "Resource not found: {}",
                message
            );
        } else {
            warn!(
                error_type = error_type,
                status = status.as_u16(),
                "Client error: {}",
                message
            );
        }

        let error_response = ErrorResponse::with_status(error_type, message, status);

        (status, Json(error_response)).into_response()
    }
}

// =============================================================================
// HTTP Dates
// =============================================================================

/// Format epoch seconds as an HTTP date.
pub fn format_http_date(epoch_seconds: i64) -> String {
    DateTime::from_timestamp(epoch_seconds, 0)
        .unwrap_or_default()
        .format(HTTP_DATE_FORMAT)
        .to_string()
}

/// Parse an HTTP date into epoch seconds.
pub fn parse_http_date(value: &str) -> Option<i64> {
    NaiveDateTime::parse_from_str(value.trim(), HTTP_DATE_FORMAT)
        .ok()
        .map(|dt| dt.and_utc().timestamp())
}

/// Whether the request's validators match the tile.
///
/// `etag` is `None` for tiles that carry no entity tag (vector payloads).
fn is_not_modified(headers: &HeaderMap, tile: &RenderedTile, etag: Option<&str>) -> bool {
    if let Some(etag) = etag {
        let matched = headers
            .get(header::IF_NONE_MATCH)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .any(|candidate| candidate == etag || candidate == &*tile.fingerprint)
            });
        if matched {
            return true;
        }
    }

    headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_http_date)
        .is_some_and(|since| since >= tile.last_modified)
}

fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: String) {
    match HeaderValue::try_from(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(e) => warn!(header = %name, error = %e, "Dropping invalid header value"),
    }
}

/// Build the response for a resolved tile.
fn tile_response(request_headers: &HeaderMap, request: &TileRequest, tile: &RenderedTile) -> Response {
    let raster = request.key.format.is_cacheable();
    let etag = raster.then(|| tile.etag());

    let mut headers = HeaderMap::new();
    if request.negotiated {
        headers.insert(header::VARY, HeaderValue::from_static("accept"));
    }
    if let Some(etag) = &etag {
        insert_header(&mut headers, header::ETAG, etag.clone());
    }

    if is_not_modified(request_headers, tile, etag.as_deref()) {
        debug!(tile = %request.key, "Tile not modified");
        return (StatusCode::NOT_MODIFIED, headers).into_response();
    }

    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(request.key.format.content_type()),
    );
    insert_header(&mut headers, header::LAST_MODIFIED, format_http_date(tile.last_modified));
    if raster {
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(TILE_CACHE_CONTROL));
    }

    (StatusCode::OK, headers, Body::from(tile.bytes.clone())).into_response()
}

// =============================================================================
// Handlers
// =============================================================================

/// Handle tile requests.
///
/// # Endpoint
///
/// `GET /{zoom}/{x}/{y}[.{ext}]`
///
/// # Path Parameters
///
/// - `zoom`: Zoom level
/// - `x`, `y`: Tile column and row
/// - `ext`: `png`, `webp` or `v`; when omitted the format follows `Accept`
///
/// # Query Parameters
///
/// - `theme`: Rendering theme (accepted, not part of the cache identity)
///
/// # Response
///
/// - `200 OK`: Tile body with `Content-Type` and `Last-Modified`; raster
///   tiles also carry `ETag` and `Cache-Control: public, max-age=86400`
/// - `304 Not Modified`: `If-None-Match` or `If-Modified-Since` matched
/// - `400 Bad Request`: Coordinates out of range for the zoom level
/// - `404 Not Found`: No map data covers the tile, or unknown asset path
/// - `500 Internal Server Error`: Rendering or encoding failed
///
/// `HEAD` gets the `GET` headers, `Content-Length` included; the router
/// drops the body.
pub async fn tile_handler<E: TileEngine>(
    State(state): State<AppState<E>>,
    uri: Uri,
    headers: HeaderMap,
    Path(params): Path<TilePathParams>,
    Query(query): Query<TileQueryParams>,
) -> Result<Response, TileError> {
    let accept = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok());
    let Some(request) = params.parse(accept) else {
        return Ok(serve_asset(state.assets.as_ref(), uri.path()).await);
    };

    if let Some(theme) = &query.theme {
        debug!(tile = %request.key, theme = %theme, "Tile requested with theme");
    }

    let tile = state.tile_service.get_tile(request.key).await?;
    Ok(tile_response(&headers, &request, &tile))
}

/// Serve any path that is not a tile.
pub async fn asset_handler<E: TileEngine>(State(state): State<AppState<E>>, uri: Uri) -> Response {
    serve_asset(state.assets.as_ref(), uri.path()).await
}

async fn serve_asset(assets: &dyn AssetResolver, path: &str) -> Response {
    match assets.resolve(path).await {
        Some(asset) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, asset.content_type)],
            Body::from(asset.bytes),
        )
            .into_response(),
        None => {
            debug!(path, "No tile or asset at path");
            let status = StatusCode::NOT_FOUND;
            let error = ErrorResponse::with_status("not_found", format!("Not found: {}", path), status);
            (status, Json(error)).into_response()
        }
    }
}

/// Handle health check requests.
///
/// # Endpoint
///
/// `GET /health`
///
/// # Response
///
/// `200 OK` with JSON body:
/// ```json
/// {
///   "status": "healthy",
///   "version": "0.1.0",
///   "cache": { "entries": 12, "weight": 40960, ... },
///   "stored_tiles": 1500
/// }
/// ```
pub async fn health_handler<E: TileEngine>(State(state): State<AppState<E>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        cache: state.tile_service.cache_stats(),
        stored_tiles: state.tile_service.store().map(|store| store.len()),
    })
}

// =============================================================================
// Tests
// =============================================================================
