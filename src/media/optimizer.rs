/// Product photo optimizer
///
/// Shrinks user-selected photos to a bounded width and byte size before
/// upload, using a three-tier policy:
/// - Tier 1: larger than `reject_size` → refused before any decode work
/// - Tier 2: at most `target_size` → returned byte-for-byte unchanged
/// - Tier 3: anything else → decoded once, width-capped, re-encoded
///
/// Resizing only ever shrinks. Height follows the width ratio, rounded to
/// the nearest pixel.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::{imageops::FilterType, DynamicImage, ImageFormat};
use tracing::{debug, info};

use crate::config::OptimizerConfig;
use crate::error::OptimizeError;

/// What the optimizer did with a blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Optimization {
    /// Already small enough, bytes untouched
    PassedThrough,
    /// Decoded, possibly resized, and re-encoded
    Reencoded {
        format: ImageFormat,
        width: u32,
        height: u32,
    },
}

/// Result of a successful optimization
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizedBlob {
    pub bytes: Vec<u8>,
    pub optimization: Optimization,
}

impl OptimizedBlob {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn was_reencoded(&self) -> bool {
        matches!(self.optimization, Optimization::Reencoded { .. })
    }
}

/// Stateless optimizer bound to one size/quality policy
#[derive(Debug, Clone)]
pub struct ImageOptimizer {
    constraints: OptimizerConfig,
}

impl ImageOptimizer {
    pub fn new(constraints: OptimizerConfig) -> Self {
        Self { constraints }
    }

    pub fn constraints(&self) -> &OptimizerConfig {
        &self.constraints
    }

    /// Optimize on the blocking pool
    ///
    /// Decoding and resampling a multi-megapixel photo is CPU-bound, so it
    /// must not run on the async executor.
    pub async fn optimize_async(&self, blob: Vec<u8>) -> Result<OptimizedBlob, OptimizeError> {
        let optimizer = self.clone();
        tokio::task::spawn_blocking(move || optimizer.optimize(&blob))
            .await
            .map_err(|e| OptimizeError::Task(e.to_string()))?
    }

    /// Apply the three-tier policy to a raw blob
    pub fn optimize(&self, blob: &[u8]) -> Result<OptimizedBlob, OptimizeError> {
        let size = blob.len() as u64;
        let limits = &self.constraints;

        // Tier 1: cheap pre-check, no decode
        if size > limits.reject_size {
            debug!(bytes = size, limit = limits.reject_size, "rejecting image before decode");
            return Err(OptimizeError::TooLarge {
                actual: size,
                limit: limits.reject_size,
            });
        }

        // Tier 2: already small enough
        if size <= limits.target_size {
            debug!(bytes = size, "image below target size, passing through");
            return Ok(OptimizedBlob {
                bytes: blob.to_vec(),
                optimization: Optimization::PassedThrough,
            });
        }

        // Tier 3: decode once, resize, re-encode
        let source_format = image::guess_format(blob).map_err(OptimizeError::DecodeFailed)?;
        let img = image::load_from_memory_with_format(blob, source_format)
            .map_err(OptimizeError::DecodeFailed)?;

        let (width, height) = scaled_dimensions(img.width(), img.height(), limits.max_width);
        let resized = if (width, height) == (img.width(), img.height()) {
            img
        } else {
            img.resize_exact(width, height, FilterType::Lanczos3)
        };

        let format = output_format(source_format);
        let bytes = encode(&resized, format, limits.jpeg_quality())?;
        let out_size = bytes.len() as u64;

        if out_size > limits.max_file_size {
            info!(
                bytes = out_size,
                limit = limits.max_file_size,
                "image still too large after optimization"
            );
            return Err(OptimizeError::PostOptimizationStillTooLarge {
                actual: out_size,
                limit: limits.max_file_size,
            });
        }

        info!(
            from_bytes = size,
            to_bytes = out_size,
            width,
            height,
            ?format,
            "optimized image"
        );

        Ok(OptimizedBlob {
            bytes,
            optimization: Optimization::Reencoded {
                format,
                width,
                height,
            },
        })
    }
}

/// New dimensions with the width capped at `max_width`
///
/// Never enlarges. Height is scaled by the same ratio and rounded to the
/// nearest integer, but never below one pixel.
pub fn scaled_dimensions(width: u32, height: u32, max_width: u32) -> (u32, u32) {
    if width <= max_width {
        return (width, height);
    }

    let ratio = height as f64 / width as f64;
    let new_height = (max_width as f64 * ratio).round().max(1.0) as u32;
    (max_width, new_height)
}

/// JPEG stays JPEG, PNG stays PNG, everything else becomes JPEG
fn output_format(source: ImageFormat) -> ImageFormat {
    match source {
        ImageFormat::Png => ImageFormat::Png,
        _ => ImageFormat::Jpeg,
    }
}

fn encode(img: &DynamicImage, format: ImageFormat, jpeg_quality: u8) -> Result<Vec<u8>, OptimizeError> {
    let mut out = Cursor::new(Vec::new());

    match format {
        ImageFormat::Png => {
            let encoder = PngEncoder::new_with_quality(&mut out, CompressionType::Best, PngFilter::Adaptive);
            img.write_with_encoder(encoder).map_err(OptimizeError::Encode)?;
        }
        _ => {
            // JPEG has no alpha channel
            let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
            let encoder = JpegEncoder::new_with_quality(&mut out, jpeg_quality);
            rgb.write_with_encoder(encoder).map_err(OptimizeError::Encode)?;
        }
    }

    Ok(out.into_inner())
}
