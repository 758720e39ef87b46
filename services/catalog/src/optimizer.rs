//! Server-side photo optimization.
//!
//! A source object is fetched, decoded, bounded to a maximum long side and
//! re-encoded as JPEG (opaque) or PNG (visible alpha). The result is written
//! under the canonical `cafes/{cafe_id}/{kind}/optimized/` prefix; the staged
//! source is removed only when the caller asks for it. AVIF sources are never decoded; they are only
//! moved into the canonical layout when needed.
//!
//! Decode, resample and encode run on the blocking pool and the number of
//! concurrent optimizations is bounded by a semaphore.

use crate::config::OptimizerConfig;
use crate::encoder::FormatEncoder;
use crate::object_store::{ObjectStore, StoreError};
use crate::photo_keys::{self, PhotoKind, MIME_AVIF, MIME_JPEG, MIME_PNG};
use crate::variants::{self, VariantReport};
use chrono::Utc;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageReader};
use serde::Serialize;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const ALPHA_GRID: u64 = 16;

#[derive(Debug, Error)]
pub enum OptimizeError {
    #[error("{0}")]
    TooLarge(String),

    #[error("{0}")]
    Invalid(String),

    #[error("unsupported mime type: {0}")]
    UnsupportedMime(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("image codec failure: {0}")]
    Codec(String),

    #[error("optimization deadline exceeded")]
    DeadlineExceeded,
}

/// What to optimize
#[derive(Debug, Clone)]
pub struct OptimizeRequest {
    pub cafe_id: Uuid,
    pub kind: PhotoKind,
    pub source_key: String,
    /// Mime type recorded when the photo was accepted
    pub declared_mime: String,
    pub declared_size: i64,
    /// Remove the source once the canonical object is written. Callers that
    /// still reference the source from the database delete it after commit.
    pub delete_source: bool,
}

/// Outcome of one optimization
#[derive(Debug, Clone, Serialize)]
pub struct OptimizedPhoto {
    pub object_key: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// True when the canonical object was (re)written
    pub rewritten: bool,
    pub variants: VariantReport,
}

impl OptimizedPhoto {
    /// Objects this run wrote; empty when the source was kept in place
    pub fn written_keys(&self) -> Vec<&str> {
        if !self.rewritten {
            return Vec::new();
        }
        std::iter::once(self.object_key.as_str())
            .chain(self.variants.written.iter().map(String::as_str))
            .collect()
    }
}

/// Tunables for the pure transformation step
#[derive(Debug, Clone, Copy)]
pub struct TransformOptions {
    pub max_dimension: u32,
    pub max_pixels: u64,
    pub jpeg_quality: u8,
}

impl From<&OptimizerConfig> for TransformOptions {
    fn from(config: &OptimizerConfig) -> Self {
        Self {
            max_dimension: config.max_dimension,
            max_pixels: config.max_pixels,
            jpeg_quality: config.jpeg_quality,
        }
    }
}

/// Result of [`transform`]
#[derive(Debug, Clone)]
pub struct Transformed {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    /// Output bytes differ from the input bytes
    pub changed: bool,
    pub resized: bool,
    /// Decoded (and possibly resized) pixels, kept for variant generation
    pub image: Option<Arc<DynamicImage>>,
}

/// Decode, bound and re-encode an image. AVIF input passes through untouched.
pub fn transform(
    original: Vec<u8>,
    mime_type: &str,
    options: &TransformOptions,
) -> Result<Transformed, OptimizeError> {
    if mime_type == MIME_AVIF {
        return Ok(Transformed {
            bytes: original,
            mime_type: MIME_AVIF.to_string(),
            changed: false,
            resized: false,
            image: None,
        });
    }

    let (width, height) = ImageReader::new(Cursor::new(&original))
        .with_guessed_format()
        .map_err(|e| OptimizeError::Invalid(format!("unreadable image: {e}")))?
        .into_dimensions()
        .map_err(|e| OptimizeError::Invalid(format!("unreadable image header: {e}")))?;

    if width == 0 || height == 0 {
        return Err(OptimizeError::Invalid("image has no pixels".to_string()));
    }
    if u64::from(width) * u64::from(height) > options.max_pixels {
        return Err(OptimizeError::TooLarge(format!(
            "image is {width}x{height}, above {} pixels",
            options.max_pixels
        )));
    }

    let decoded = ImageReader::new(Cursor::new(&original))
        .with_guessed_format()
        .map_err(|e| OptimizeError::Invalid(format!("unreadable image: {e}")))?
        .decode()
        .map_err(|e| OptimizeError::Invalid(format!("image decode failed: {e}")))?;

    let (image, resized) = match bounded_dimensions(width, height, options.max_dimension) {
        Some((w, h)) => (decoded.resize_exact(w, h, FilterType::CatmullRom), true),
        None => (decoded, false),
    };

    let out_mime = if has_visible_alpha(&image) {
        MIME_PNG
    } else {
        MIME_JPEG
    };
    let encoded = encode_image(&image, out_mime, options.jpeg_quality)?;

    // No quality loss for no win
    let (bytes, mime_type, changed) = if !resized && encoded.len() >= original.len() {
        (original, mime_type.to_string(), false)
    } else {
        (encoded, out_mime.to_string(), true)
    };

    Ok(Transformed {
        changed,
        bytes,
        mime_type,
        resized,
        image: Some(Arc::new(image)),
    })
}

/// Target size when the long side exceeds `max_dimension`
pub fn bounded_dimensions(width: u32, height: u32, max_dimension: u32) -> Option<(u32, u32)> {
    let long_side = width.max(height);
    if long_side <= max_dimension {
        return None;
    }
    let scale = f64::from(max_dimension) / f64::from(long_side);
    let w = ((f64::from(width) * scale).round() as u32).clamp(1, max_dimension);
    let h = ((f64::from(height) * scale).round() as u32).clamp(1, max_dimension);
    Some((w, h))
}

/// Sample a 16x16 grid plus the bottom-right pixel for any non-opaque alpha
pub fn has_visible_alpha(image: &DynamicImage) -> bool {
    if !image.color().has_alpha() {
        return false;
    }
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return false;
    }

    for gy in 0..ALPHA_GRID {
        for gx in 0..ALPHA_GRID {
            let x = (gx * u64::from(width) / ALPHA_GRID) as u32;
            let y = (gy * u64::from(height) / ALPHA_GRID) as u32;
            if image.get_pixel(x, y)[3] < u8::MAX {
                return true;
            }
        }
    }
    image.get_pixel(width - 1, height - 1)[3] < u8::MAX
}

/// Encode as JPEG (alpha dropped) or PNG
pub fn encode_image(
    image: &DynamicImage,
    mime_type: &str,
    jpeg_quality: u8,
) -> Result<Vec<u8>, OptimizeError> {
    let mut buf = Cursor::new(Vec::new());
    match mime_type {
        MIME_JPEG => DynamicImage::ImageRgb8(image.to_rgb8())
            .write_with_encoder(JpegEncoder::new_with_quality(&mut buf, jpeg_quality))
            .map_err(|e| OptimizeError::Codec(format!("jpeg encode: {e}")))?,
        MIME_PNG => DynamicImage::ImageRgba8(image.to_rgba8())
            .write_with_encoder(PngEncoder::new(&mut buf))
            .map_err(|e| OptimizeError::Codec(format!("png encode: {e}")))?,
        other => return Err(OptimizeError::UnsupportedMime(other.to_string())),
    }
    Ok(buf.into_inner())
}

/// Optimizer service shared by the API and the backfill binary
pub struct PhotoOptimizer {
    store: Arc<dyn ObjectStore>,
    encoder: Option<Arc<dyn FormatEncoder>>,
    config: OptimizerConfig,
    max_upload_bytes: i64,
    permits: Arc<Semaphore>,
}

impl PhotoOptimizer {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        encoder: Option<Arc<dyn FormatEncoder>>,
        config: OptimizerConfig,
        max_upload_bytes: i64,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            store,
            encoder,
            config,
            max_upload_bytes,
            permits,
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Remove everything an optimization wrote, when its result is not going
    /// to be referenced. Failures are logged.
    pub async fn discard(&self, optimized: &OptimizedPhoto) {
        for key in optimized.written_keys() {
            if let Err(e) = self.store.delete(key).await {
                warn!(error = %e, key = %key, "Failed to remove orphaned photo object");
            }
        }
    }

    /// Optimize one photo under the configured deadline
    #[instrument(skip(self, request), fields(cafe_id = %request.cafe_id, kind = %request.kind, source_key = %request.source_key))]
    pub async fn optimize(&self, request: &OptimizeRequest) -> Result<OptimizedPhoto, OptimizeError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| OptimizeError::Codec("optimizer is shutting down".to_string()))?;

        let started = Instant::now();
        let result = tokio::time::timeout(self.config.timeout(), self.run(request))
            .await
            .map_err(|_| OptimizeError::DeadlineExceeded)?;
        metrics::histogram!("catalog.optimize.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        result
    }

    async fn run(&self, request: &OptimizeRequest) -> Result<OptimizedPhoto, OptimizeError> {
        let source_key = photo_keys::trim_key(&request.source_key).to_string();
        let source = self.store.get(&source_key).await?;

        let observed = photo_keys::normalize_mime(&source.mime_type);
        let mime = if observed.is_empty() {
            photo_keys::normalize_mime(&request.declared_mime)
        } else {
            observed
        };
        if !photo_keys::is_allowed_mime(&mime) {
            return Err(OptimizeError::UnsupportedMime(mime));
        }

        debug!(
            size_bytes = source.bytes.len(),
            declared_size = request.declared_size,
            mime = %mime,
            "Fetched photo source"
        );

        let options = TransformOptions::from(&self.config);
        let transformed = tokio::task::spawn_blocking(move || transform(source.bytes, &mime, &options))
            .await
            .map_err(|e| OptimizeError::Codec(format!("optimizer task failed: {e}")))??;

        let declared = photo_keys::normalize_mime(&request.declared_mime);
        let rewrite = transformed.changed
            || declared != transformed.mime_type
            || !photo_keys::is_under_cafe_prefix(&source_key, request.cafe_id, request.kind);

        let size_bytes = transformed.bytes.len() as i64;
        if size_bytes > self.max_upload_bytes {
            return Err(OptimizeError::TooLarge(format!(
                "optimized photo is {size_bytes} bytes, above {} bytes",
                self.max_upload_bytes
            )));
        }

        let (width, height) = transformed
            .image
            .as_ref()
            .map(|img| img.dimensions())
            .map_or((None, None), |(w, h)| (Some(w), Some(h)));

        let object_key = if rewrite {
            let ext = photo_keys::extension_for_mime(&transformed.mime_type)
                .ok_or_else(|| OptimizeError::UnsupportedMime(transformed.mime_type.clone()))?;
            let key = photo_keys::canonical_key(
                request.cafe_id,
                request.kind,
                &transformed.bytes,
                ext,
                Utc::now(),
            );
            self.store
                .put(&key, &transformed.mime_type, transformed.bytes)
                .await?;

            if request.delete_source && key != source_key {
                if let Err(e) = self.store.delete(&source_key).await {
                    warn!(error = %e, key = %source_key, "Failed to delete photo source");
                }
            }
            key
        } else {
            source_key
        };

        let variants = match transformed.image {
            Some(ref image) if photo_keys::is_optimized_key(&object_key) => {
                variants::generate(
                    self.store.as_ref(),
                    self.encoder.as_deref(),
                    Arc::clone(image),
                    &object_key,
                    &transformed.mime_type,
                    &self.config.variant_widths,
                    self.config.jpeg_quality,
                )
                .await
            }
            _ => VariantReport::default(),
        };

        metrics::counter!(
            "catalog.photos.optimized",
            "rewritten" => if rewrite { "true" } else { "false" }
        )
        .increment(1);

        info!(
            object_key = %object_key,
            mime = %transformed.mime_type,
            size_bytes = size_bytes,
            rewritten = rewrite,
            variants = variants.written.len(),
            variant_failures = variants.failures.len(),
            "Photo optimized"
        );

        Ok(OptimizedPhoto {
            object_key,
            mime_type: transformed.mime_type,
            size_bytes,
            width,
            height,
            rewritten: rewrite,
            variants,
        })
    }
}
