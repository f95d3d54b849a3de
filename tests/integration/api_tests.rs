//! API integration tests for tile retrieval and error handling.
//!
//! Tests verify:
//! - Raster tiles render once and are served with stable validators
//! - Conditional requests answer 304 without a body
//! - Content negotiation and `Vary`
//! - Vector tiles are rendered on every request
//! - Error cases (out of range, no coverage, unknown paths)
//! - Static assets and the health endpoint

use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use http_body_util::BodyExt;

use map_tile_server::server::{format_http_date, TILE_CACHE_CONTROL};

use tokio::net::TcpStream;

use super::test_utils::{
    get, is_png, is_webp, raw_header, raw_request, send, spawn_server, test_router, test_service, StubEngine,
};

/// The CORS layer appends its own `Vary` values, so look at all of them.
fn varies_on_accept(response: &axum::http::Response<Body>) -> bool {
    response.headers().get_all(header::VARY).iter().any(|v| v == "accept")
}

async fn body_bytes(response: axum::http::Response<Body>) -> bytes::Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

// =============================================================================
// Basic Tile Retrieval
// =============================================================================

#[tokio::test]
async fn test_png_tile_retrieval() {
    let service = test_service(StubEngine::new(), None);
    let router = test_router(service.clone());

    let response = get(&router, "/3/2/1.png").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get(header::CONTENT_TYPE).unwrap(), "image/png");
    assert_eq!(response.headers().get(header::CACHE_CONTROL).unwrap(), TILE_CACHE_CONTROL);
    assert_eq!(response.headers().get(header::ETAG).unwrap(), "\"v1-3/2/1.png\"");
    assert!(response.headers().contains_key(header::LAST_MODIFIED));
    assert!(!varies_on_accept(&response));

    let body = body_bytes(response).await;
    assert!(is_png(&body), "Response should be a valid PNG");
}

#[tokio::test]
async fn test_repeat_request_served_from_cache() {
    let service = test_service(StubEngine::new(), None);
    let router = test_router(service.clone());

    let first = get(&router, "/5/10/12.webp").await;
    let first_etag = first.headers().get(header::ETAG).cloned().unwrap();
    let first_body = body_bytes(first).await;

    let second = get(&router, "/5/10/12.webp").await;
    assert_eq!(second.headers().get(header::ETAG).unwrap(), &first_etag);
    assert_eq!(body_bytes(second).await, first_body);

    assert!(is_webp(&first_body));
    assert_eq!(service.engine().renders(), 1);
    assert_eq!(service.cache_stats().hits, 1);
}

#[tokio::test]
async fn test_theme_is_not_part_of_identity() {
    let service = test_service(StubEngine::new(), None);
    let router = test_router(service.clone());

    assert_eq!(get(&router, "/3/2/1.png?theme=osmarender").await.status(), StatusCode::OK);
    assert_eq!(get(&router, "/3/2/1.png?theme=elevate").await.status(), StatusCode::OK);

    assert_eq!(service.engine().renders(), 1);
}

#[tokio::test]
async fn test_head_request_has_headers_without_body() {
    let service = test_service(StubEngine::new(), None);
    let router = test_router(service);

    let request = Request::builder()
        .method(Method::HEAD)
        .uri("/2/1/1.png")
        .body(Body::empty())
        .unwrap();
    let response = send(&router, request).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get(header::CONTENT_TYPE).unwrap(), "image/png");
    assert!(response.headers().contains_key(header::ETAG));
    let head_length = response.headers().get(header::CONTENT_LENGTH).cloned();
    assert!(body_bytes(response).await.is_empty());

    let response = get(&router, "/2/1/1.png").await;
    let get_length = response.headers().get(header::CONTENT_LENGTH).cloned();
    let body = body_bytes(response).await;
    assert_eq!(head_length, get_length);
    assert_eq!(get_length.unwrap(), body.len().to_string().as_str());
}

#[tokio::test]
async fn test_head_content_length_on_the_wire() {
    let service = test_service(StubEngine::new(), None);
    let addr = spawn_server(test_router(service)).await;
    let mut client = TcpStream::connect(addr).await.unwrap();

    for path in ["/2/1/1.png", "/2/1/1.webp", "/symbols/bus.svg"] {
        let full = raw_request(&mut client, "GET", path).await;
        let head = raw_request(&mut client, "HEAD", path).await;
        assert!(head.starts_with("HTTP/1.1 200"), "{}: {}", path, head);

        let get_length = raw_header(&full, "content-length").unwrap();
        assert_ne!(get_length, "0");
        assert_eq!(raw_header(&head, "content-length"), Some(get_length), "{}", path);
        assert!(head.ends_with("\r\n\r\n"), "HEAD response carried a body");
    }
}

// =============================================================================
// Load Once Per Key
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_render_once() {
    let engine = StubEngine::new().with_render_delay(Duration::from_millis(100));
    let service = test_service(engine, None);
    let router = test_router(service.clone());

    let mut tasks = Vec::new();
    for _ in 0..50 {
        let router = router.clone();
        tasks.push(tokio::spawn(async move {
            let response = get(&router, "/7/60/40.png").await;
            let status = response.status();
            let etag = response.headers().get(header::ETAG).cloned();
            (status, etag, body_bytes(response).await)
        }));
    }

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap());
    }

    assert_eq!(service.engine().renders(), 1);
    let (_, etag, body) = &results[0];
    for (status, other_etag, other_body) in &results {
        assert_eq!(*status, StatusCode::OK);
        assert_eq!(other_etag, etag);
        assert_eq!(other_body, body);
    }
}

// =============================================================================
// Conditional Requests
// =============================================================================

#[tokio::test]
async fn test_if_none_match_returns_not_modified() {
    let service = test_service(StubEngine::new(), None);
    let router = test_router(service.clone());

    let first = get(&router, "/4/3/2.png").await;
    let etag = first.headers().get(header::ETAG).cloned().unwrap();

    let request = Request::builder()
        .uri("/4/3/2.png")
        .header(header::IF_NONE_MATCH, etag.clone())
        .body(Body::empty())
        .unwrap();
    let response = send(&router, request).await;

    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(response.headers().get(header::ETAG).unwrap(), &etag);
    assert!(body_bytes(response).await.is_empty());
    assert_eq!(service.engine().renders(), 1);
}

#[tokio::test]
async fn test_stale_etag_returns_full_response() {
    let service = test_service(StubEngine::new(), None);
    let router = test_router(service);

    let request = Request::builder()
        .uri("/4/3/2.png")
        .header(header::IF_NONE_MATCH, "\"v0-4/3/2.png\"")
        .body(Body::empty())
        .unwrap();
    let response = send(&router, request).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(!body_bytes(response).await.is_empty());
}

#[tokio::test]
async fn test_if_modified_since() {
    let service = test_service(StubEngine::new(), None);
    let router = test_router(service);

    let first = get(&router, "/4/3/2.png").await;
    let last_modified = first
        .headers()
        .get(header::LAST_MODIFIED)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    let request = Request::builder()
        .uri("/4/3/2.png")
        .header(header::IF_MODIFIED_SINCE, last_modified)
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&router, request).await.status(), StatusCode::NOT_MODIFIED);

    let request = Request::builder()
        .uri("/4/3/2.png")
        .header(header::IF_MODIFIED_SINCE, format_http_date(0))
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&router, request).await.status(), StatusCode::OK);
}

// =============================================================================
// Content Negotiation
// =============================================================================

#[tokio::test]
async fn test_negotiates_webp_from_accept() {
    let service = test_service(StubEngine::new(), None);
    let router = test_router(service);

    let request = Request::builder()
        .uri("/6/20/30")
        .header(header::ACCEPT, "image/avif,image/webp,*/*")
        .body(Body::empty())
        .unwrap();
    let response = send(&router, request).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get(header::CONTENT_TYPE).unwrap(), "image/webp");
    assert!(varies_on_accept(&response));
    assert!(is_webp(&body_bytes(response).await));
}

#[tokio::test]
async fn test_negotiates_png_by_default() {
    let service = test_service(StubEngine::new(), None);
    let router = test_router(service);

    let response = get(&router, "/6/20/30").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get(header::CONTENT_TYPE).unwrap(), "image/png");
    assert!(varies_on_accept(&response));
}

// =============================================================================
// Vector Tiles
// =============================================================================

#[tokio::test]
async fn test_vector_tiles_always_render() {
    let service = test_service(StubEngine::new(), None);
    let router = test_router(service.clone());

    let first = get(&router, "/3/2/1.v").await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers().get(header::CONTENT_TYPE).unwrap(), "application/json");
    assert!(!first.headers().contains_key(header::ETAG));
    assert!(!first.headers().contains_key(header::CACHE_CONTROL));
    let first_body = body_bytes(first).await;

    let second_body = body_bytes(get(&router, "/3/2/1.v").await).await;

    assert_ne!(first_body, second_body);
    assert_eq!(service.engine().vector_renders(), 2);
    assert!(service.cache().is_empty());
}

#[tokio::test]
async fn test_vector_sees_cached_raster_neighbours() {
    let service = test_service(StubEngine::new(), None);
    let router = test_router(service);

    let before = body_bytes(get(&router, "/3/2/1.v").await).await;
    assert!(String::from_utf8_lossy(&before).contains(r#""png_cached":false"#));

    get(&router, "/3/2/1.png").await;

    let after = body_bytes(get(&router, "/3/2/1.v").await).await;
    assert!(String::from_utf8_lossy(&after).contains(r#""png_cached":true"#));
}

// =============================================================================
// Error Handling
// =============================================================================

#[tokio::test]
async fn test_out_of_range_is_bad_request() {
    let service = test_service(StubEngine::new(), None);
    let router = test_router(service.clone());

    let response = get(&router, "/2/4/0.png").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = body_bytes(response).await;
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "out_of_range");
    assert_eq!(json["status"], 400);

    assert_eq!(get(&router, "/0/0/1.v").await.status(), StatusCode::BAD_REQUEST);
    assert_eq!(service.engine().renders(), 0);
    assert_eq!(service.engine().vector_renders(), 0);
}

#[tokio::test]
async fn test_uncovered_tile_is_not_found() {
    let service = test_service(StubEngine::new(), None);
    let router = test_router(service.clone());

    let response = get(&router, "/14/100/100.png").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(json["error"], "not_found");

    assert_eq!(get(&router, "/14/100/100.v").await.status(), StatusCode::NOT_FOUND);
    assert!(service.cache().is_empty());
}

#[tokio::test]
async fn test_unknown_extension_falls_through_to_assets() {
    let service = test_service(StubEngine::new(), None);
    let router = test_router(service.clone());

    assert_eq!(get(&router, "/3/2/1.jpg").await.status(), StatusCode::NOT_FOUND);
    assert_eq!(get(&router, "/not/a/tile/at/all").await.status(), StatusCode::NOT_FOUND);
    assert_eq!(service.engine().renders(), 0);
}

#[tokio::test]
async fn test_signed_coordinates_are_not_tiles() {
    let service = test_service(StubEngine::new(), None);
    let router = test_router(service.clone());

    for uri in ["/2/+1/1.png", "/+2/1/1.png", "/2/1/+1.png", "/2/1/+1"] {
        assert_eq!(get(&router, uri).await.status(), StatusCode::NOT_FOUND, "{}", uri);
    }
    assert_eq!(service.engine().renders(), 0);
    assert!(service.cache().is_empty());
}

// =============================================================================
// Assets and Health
// =============================================================================

#[tokio::test]
async fn test_assets_served_for_non_tile_paths() {
    let service = test_service(StubEngine::new(), None);
    let router = test_router(service);

    let response = get(&router, "/symbols/bus.svg").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get(header::CONTENT_TYPE).unwrap(), "image/svg+xml");
    assert_eq!(&body_bytes(response).await[..], b"<svg/>");

    // Three segments reach the tile route first and fall through
    let response = get(&router, "/patterns/wood/oak.png").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(&body_bytes(response).await[..], b"oak");
}

#[tokio::test]
async fn test_health_reports_cache_stats() {
    let service = test_service(StubEngine::new(), None);
    let router = test_router(service);

    get(&router, "/1/0/0.png").await;
    get(&router, "/1/0/0.png").await;

    let response = get(&router, "/health").await;
    assert_eq!(response.status(), StatusCode::OK);

    let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["cache"]["entries"], 1);
    assert_eq!(json["cache"]["hits"], 1);
    assert!(json.get("stored_tiles").is_none());
}

#[tokio::test]
async fn test_cors_headers_present() {
    let service = test_service(StubEngine::new(), None);
    let router = test_router(service);

    let request = Request::builder()
        .uri("/1/0/0.png")
        .header(header::ORIGIN, "https://maps.example.com")
        .body(Body::empty())
        .unwrap();
    let response = send(&router, request).await;

    assert_eq!(response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
}
