//! Static asset resolution for non-tile paths.
//!
//! Requests that do not match the tile path convention are handed to an
//! [`AssetResolver`]. The shipped [`ThemeAssets`] serves files (symbols,
//! patterns, stylesheets) from the directories that contain the configured
//! theme files.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, trace};

/// A static file ready to be sent.
#[derive(Debug, Clone)]
pub struct Asset {
    pub bytes: Bytes,
    pub content_type: &'static str,
}

/// Looks up static content for a request path.
#[async_trait]
pub trait AssetResolver: Send + Sync + 'static {
    /// Content for `path` (the raw request path), or `None` if unknown.
    async fn resolve(&self, path: &str) -> Option<Asset>;
}

/// Serves files relative to the directories holding the theme files.
#[derive(Debug, Clone, Default)]
pub struct ThemeAssets {
    roots: Vec<PathBuf>,
}

impl ThemeAssets {
    /// Create a resolver rooted at the parent directory of each theme file.
    pub fn new(theme_files: &[PathBuf]) -> Self {
        let mut roots: Vec<PathBuf> = Vec::new();
        for file in theme_files {
            let root = file
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            if !roots.contains(&root) {
                roots.push(root);
            }
        }
        Self { roots }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }
}

/// Turn a request path into a relative path, refusing anything that could
/// escape the asset roots.
fn sanitize(path: &str) -> Option<PathBuf> {
    let relative = Path::new(path.trim_start_matches('/'));
    let mut clean = PathBuf::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!clean.as_os_str().is_empty()).then_some(clean)
}

/// Content type for a file, based on its extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("xml") => "application/xml",
        Some("json") => "application/json",
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        _ => "application/octet-stream",
    }
}

#[async_trait]
impl AssetResolver for ThemeAssets {
    async fn resolve(&self, path: &str) -> Option<Asset> {
        let relative = sanitize(path)?;

        for root in &self.roots {
            let candidate = root.join(&relative);
            match tokio::fs::read(&candidate).await {
                Ok(data) => {
                    debug!(path = %candidate.display(), bytes = data.len(), "Serving asset");
                    return Some(Asset {
                        bytes: Bytes::from(data),
                        content_type: content_type_for(&candidate),
                    });
                }
                Err(e) => trace!(path = %candidate.display(), error = %e, "Asset not readable"),
            }
        }
        None
    }
}

// =============================================================================
// Tests
// =============================================================================
