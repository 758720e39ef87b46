//! Responsive variants of an optimized photo.
//!
//! Raster variants re-encode the canonical image at each configured width
//! narrower than the source. Alternate formats (WebP/AVIF) are requested from
//! the external encoder by public URL. Every variant is best-effort: failures
//! are logged and reported, never propagated.

use crate::encoder::FormatEncoder;
use crate::object_store::ObjectStore;
use crate::optimizer::{encode_image, OptimizeError};
use crate::photo_keys::{self, MIME_JPEG, MIME_PNG};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, Serialize)]
pub struct VariantReport {
    /// Keys written
    pub written: Vec<String>,
    /// `{key}: {reason}` for each variant that could not be produced
    pub failures: Vec<String>,
}

impl VariantReport {
    fn fail(&mut self, key: String, reason: impl std::fmt::Display) {
        warn!(key = %key, reason = %reason, "Variant generation failed");
        metrics::counter!("catalog.variants.failed").increment(1);
        self.failures.push(format!("{key}: {reason}"));
    }
}

/// Configured widths strictly narrower than the source, ascending and unique
pub fn select_widths(configured: &[u32], source_width: u32) -> Vec<u32> {
    let mut widths: Vec<u32> = configured
        .iter()
        .copied()
        .filter(|w| *w > 0 && *w < source_width)
        .collect();
    widths.sort_unstable();
    widths.dedup();
    widths
}

/// Height that keeps the aspect ratio at `width`, never below 1
pub fn scaled_height(source_width: u32, source_height: u32, width: u32) -> u32 {
    let h = (f64::from(source_height) * f64::from(width) / f64::from(source_width)).round();
    (h as u32).max(1)
}

fn encode_raster_variants(
    image: &DynamicImage,
    mime_type: &str,
    widths: &[u32],
    jpeg_quality: u8,
) -> Vec<(u32, Result<Vec<u8>, OptimizeError>)> {
    let (source_width, source_height) = image.dimensions();
    widths
        .iter()
        .map(|&width| {
            let height = scaled_height(source_width, source_height, width);
            let resized = image.resize_exact(width, height, FilterType::CatmullRom);
            (width, encode_image(&resized, mime_type, jpeg_quality))
        })
        .collect()
}

/// Produce all variants for a canonical JPEG/PNG object
pub async fn generate(
    store: &dyn ObjectStore,
    encoder: Option<&dyn FormatEncoder>,
    image: Arc<DynamicImage>,
    canonical_key: &str,
    mime_type: &str,
    configured_widths: &[u32],
    jpeg_quality: u8,
) -> VariantReport {
    let mut report = VariantReport::default();
    if mime_type != MIME_JPEG && mime_type != MIME_PNG {
        return report;
    }

    let widths = select_widths(configured_widths, image.width());
    if widths.is_empty() {
        return report;
    }

    let encoded = {
        let widths = widths.clone();
        let mime = mime_type.to_string();
        tokio::task::spawn_blocking(move || {
            encode_raster_variants(&image, &mime, &widths, jpeg_quality)
        })
        .await
    };

    match encoded {
        Ok(encoded) => {
            for (width, result) in encoded {
                let key = photo_keys::raster_variant_key(canonical_key, width);
                match result {
                    Ok(bytes) => match store.put(&key, mime_type, bytes).await {
                        Ok(()) => report.written.push(key),
                        Err(e) => report.fail(key, e),
                    },
                    Err(e) => report.fail(key, e),
                }
            }
        }
        Err(e) => report.fail(canonical_key.to_string(), format!("variant task failed: {e}")),
    }

    let Some(encoder) = encoder else {
        return report;
    };
    let source_url = match store.public_url(canonical_key) {
        Ok(url) => url,
        Err(e) => {
            report.fail(canonical_key.to_string(), e);
            return report;
        }
    };

    for format in encoder.formats() {
        for &width in &widths {
            let key = photo_keys::format_variant_key(canonical_key, width, format.as_str());
            let encoded = match encoder.encode(&source_url, width, format).await {
                Ok(encoded) => encoded,
                Err(e) => {
                    report.fail(key, e);
                    continue;
                }
            };

            let content_type = if encoded.content_type.starts_with("image/") {
                photo_keys::normalize_mime(&encoded.content_type)
            } else {
                format.mime_type().to_string()
            };
            match store.put(&key, &content_type, encoded.bytes).await {
                Ok(()) => report.written.push(key),
                Err(e) => report.fail(key, e),
            }
        }
    }

    debug!(
        canonical_key = %canonical_key,
        written = report.written.len(),
        failed = report.failures.len(),
        "Variants generated"
    );

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::memory::MemoryObjectStore;
    use image::{ImageBuffer, Rgb};

    #[test]
    fn test_select_widths() {
        assert_eq!(select_widths(&[320, 640, 1024, 1536], 2048), vec![320, 640, 1024, 1536]);
        assert_eq!(select_widths(&[1536, 320, 640, 320], 700), vec![320, 640]);
        assert!(select_widths(&[320, 640], 320).is_empty());
        assert!(select_widths(&[0], 100).is_empty());
    }

    #[test]
    fn test_scaled_height() {
        assert_eq!(scaled_height(2048, 1339, 320), 209);
        assert_eq!(scaled_height(2048, 1339, 1536), 1004);
        assert_eq!(scaled_height(4000, 1, 320), 1);
    }

    #[tokio::test]
    async fn test_generate_skips_avif() {
        let store = MemoryObjectStore::new();
        let image = Arc::new(DynamicImage::ImageRgb8(ImageBuffer::new(800, 600)));
        let report = generate(
            &store,
            None,
            image,
            "cafes/c/cafe/optimized/1_a.avif",
            "image/avif",
            &[320],
            82,
        )
        .await;

        assert!(report.written.is_empty());
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_generate_raster_variants() {
        let store = MemoryObjectStore::new();
        let image = Arc::new(DynamicImage::ImageRgb8(ImageBuffer::from_pixel(
            800,
            600,
            Rgb([10u8, 120, 200]),
        )));
        let canonical = "cafes/c/cafe/optimized/1_a.jpg";
        let report = generate(&store, None, image, canonical, MIME_JPEG, &[320, 640, 1024], 82).await;

        assert_eq!(
            report.written,
            vec![
                "cafes/c/cafe/optimized/1_a_w320.jpg".to_string(),
                "cafes/c/cafe/optimized/1_a_w640.jpg".to_string(),
            ]
        );
        assert!(report.failures.is_empty());

        let variant = store.object("cafes/c/cafe/optimized/1_a_w320.jpg").unwrap();
        let decoded = image::load_from_memory(&variant.bytes).unwrap();
        assert_eq!(decoded.dimensions(), (320, 240));
    }
}
