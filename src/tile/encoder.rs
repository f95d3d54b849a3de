//! Raster tile encoder.
//!
//! Turns the RGBA pixel buffer produced by the rendering engine into the
//! requested container format. The encoder is chosen by [`ImageFormat`]:
//!
//! - **PNG**: standard deflate-compressed PNG
//! - **WebP**: lossless WebP, the format served to clients that accept it
//!
//! Vector payloads never pass through here.

use bytes::Bytes;
use image::codecs::png::PngEncoder;
use image::codecs::webp::WebPEncoder;
use image::{ExtendedColorType, ImageEncoder, RgbaImage};

use crate::error::TileError;

use super::key::ImageFormat;

/// Initial capacity of the output buffer.
const INITIAL_OUTPUT_CAPACITY: usize = 8 * 1024;

// =============================================================================
// Tile Encoder
// =============================================================================

/// Encoder for rendered tile pixels.
///
/// # Example
///
/// ```
/// use image::RgbaImage;
/// use map_tile_server::tile::{ImageFormat, TileEncoder};
///
/// let pixels = RgbaImage::new(256, 256);
/// let png = TileEncoder::new().encode(&pixels, ImageFormat::Png).unwrap();
/// assert_eq!(&png[1..4], b"PNG");
/// ```
#[derive(Debug, Clone, Default)]
pub struct TileEncoder {}

impl TileEncoder {
    pub fn new() -> Self {
        Self {}
    }

    /// Encode `pixels` into `format`.
    ///
    /// # Errors
    ///
    /// Returns [`TileError::EncodeFailure`] if the codec rejects the buffer or
    /// if `format` is not a raster format.
    pub fn encode(&self, pixels: &RgbaImage, format: ImageFormat) -> Result<Bytes, TileError> {
        let mut output = Vec::with_capacity(INITIAL_OUTPUT_CAPACITY);
        let (width, height) = pixels.dimensions();

        let result = match format {
            ImageFormat::Png => PngEncoder::new(&mut output).write_image(
                pixels.as_raw(),
                width,
                height,
                ExtendedColorType::Rgba8,
            ),
            ImageFormat::Webp => WebPEncoder::new_lossless(&mut output).write_image(
                pixels.as_raw(),
                width,
                height,
                ExtendedColorType::Rgba8,
            ),
            ImageFormat::Vector => {
                return Err(TileError::EncodeFailure {
                    format: "v",
                    message: "vector payloads are not raster encoded".to_string(),
                })
            }
        };

        result.map_err(|e| TileError::EncodeFailure {
            format: format.extension(),
            message: e.to_string(),
        })?;

        Ok(Bytes::from(output))
    }
}

// =============================================================================
// Tests
// =============================================================================
