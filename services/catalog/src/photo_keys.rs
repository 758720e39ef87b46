//! Object-store layout for cafe photos.
//!
//! ```text
//! pending/submissions/{user_id}/{unix_sec}_{token}{ext}        staged uploads
//! cafes/{cafe_id}/{kind}/{unix_sec}_{token}{ext}               direct uploads
//! cafes/{cafe_id}/{kind}/optimized/{unix_nanos}_{hash16}{ext}  optimizer output
//! {canonical_base}_w{width}{ext}                               raster variants
//! {canonical_base}_w{width}.{fmt}                              alternate formats
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const MIME_JPEG: &str = "image/jpeg";
pub const MIME_PNG: &str = "image/png";
pub const MIME_WEBP: &str = "image/webp";
pub const MIME_AVIF: &str = "image/avif";

/// Upload mime types accepted anywhere in the pipeline
pub const ALLOWED_MIME_TYPES: [&str; 4] = [MIME_JPEG, MIME_PNG, MIME_WEBP, MIME_AVIF];

const PENDING_ROOT: &str = "pending/submissions";
const OPTIMIZED_SEGMENT: &str = "/optimized/";

/// Which gallery of a cafe a photo belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhotoKind {
    Cafe,
    Menu,
}

impl PhotoKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhotoKind::Cafe => "cafe",
            PhotoKind::Menu => "menu",
        }
    }
}

impl fmt::Display for PhotoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhotoKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cafe" => Ok(PhotoKind::Cafe),
            "menu" => Ok(PhotoKind::Menu),
            other => Err(format!("unknown photo kind: {other}")),
        }
    }
}

/// Lowercase a mime type and drop any parameters after `;`
pub fn normalize_mime(mime: &str) -> String {
    mime.split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

pub fn is_allowed_mime(mime: &str) -> bool {
    ALLOWED_MIME_TYPES.contains(&mime)
}

/// File extension (with dot) for an allowed mime type
pub fn extension_for_mime(mime: &str) -> Option<&'static str> {
    match mime {
        MIME_JPEG => Some(".jpg"),
        MIME_PNG => Some(".png"),
        MIME_WEBP => Some(".webp"),
        MIME_AVIF => Some(".avif"),
        _ => None,
    }
}

/// Trim leading slashes from an object key
pub fn trim_key(key: &str) -> &str {
    key.trim().trim_start_matches('/')
}

/// Staging prefix owned by a user: `pending/submissions/{user_id}/`
pub fn pending_prefix(user_id: Uuid) -> String {
    format!("{PENDING_ROOT}/{user_id}/")
}

pub fn is_under_pending_prefix(key: &str, user_id: Uuid) -> bool {
    trim_key(key).starts_with(&pending_prefix(user_id))
}

/// Unguessable per-upload token
fn upload_token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Key for a staged upload under the author's pending prefix
pub fn pending_upload_key(user_id: Uuid, ext: &str, now: DateTime<Utc>) -> String {
    format!(
        "{prefix}{secs}_{token}{ext}",
        prefix = pending_prefix(user_id),
        secs = now.timestamp(),
        token = upload_token(),
    )
}

/// Prefix every object of a cafe gallery lives under: `cafes/{cafe_id}/{kind}/`
pub fn cafe_prefix(cafe_id: Uuid, kind: PhotoKind) -> String {
    format!("cafes/{cafe_id}/{kind}/")
}

pub fn is_under_cafe_prefix(key: &str, cafe_id: Uuid, kind: PhotoKind) -> bool {
    trim_key(key).starts_with(&cafe_prefix(cafe_id, kind))
}

/// Key for a direct (non-moderated) upload into a cafe gallery
pub fn direct_upload_key(cafe_id: Uuid, kind: PhotoKind, ext: &str, now: DateTime<Utc>) -> String {
    format!(
        "{prefix}{secs}_{token}{ext}",
        prefix = cafe_prefix(cafe_id, kind),
        secs = now.timestamp(),
        token = upload_token(),
    )
}

pub fn is_optimized_key(key: &str) -> bool {
    key.contains(OPTIMIZED_SEGMENT)
}

/// First 16 hex chars of the SHA-256 of `content`
pub fn content_hash16(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    let mut hex = hex::encode(digest);
    hex.truncate(16);
    hex
}

/// Canonical optimizer output key
pub fn canonical_key(
    cafe_id: Uuid,
    kind: PhotoKind,
    content: &[u8],
    ext: &str,
    now: DateTime<Utc>,
) -> String {
    let nanos = now
        .timestamp_nanos_opt()
        .unwrap_or_else(|| now.timestamp_micros().saturating_mul(1000));
    format!(
        "{prefix}optimized/{nanos}_{hash}{ext}",
        prefix = cafe_prefix(cafe_id, kind),
        hash = content_hash16(content),
    )
}

/// Split `a/b/name.ext` into (`a/b/name`, `.ext`). Dots in directories are ignored.
pub fn split_extension(key: &str) -> (&str, &str) {
    let file_start = key.rfind('/').map(|i| i + 1).unwrap_or(0);
    match key[file_start..].rfind('.') {
        Some(dot) => key.split_at(file_start + dot),
        None => (key, ""),
    }
}

/// `{base}_w{width}{ext}` for a raster variant of a canonical key
pub fn raster_variant_key(canonical: &str, width: u32) -> String {
    let (base, ext) = split_extension(canonical);
    format!("{base}_w{width}{ext}")
}

/// `{base}_w{width}.{format}` for an alternate-format variant
pub fn format_variant_key(canonical: &str, width: u32, format: &str) -> String {
    let (base, _) = split_extension(canonical);
    format!("{base}_w{width}.{format}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn user() -> Uuid {
        Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap()
    }

    #[test]
    fn test_normalize_mime() {
        assert_eq!(normalize_mime("IMAGE/JPEG"), "image/jpeg");
        assert_eq!(normalize_mime("image/png; charset=binary"), "image/png");
        assert_eq!(normalize_mime(""), "");
    }

    #[test]
    fn test_allowed_mimes() {
        assert!(is_allowed_mime("image/avif"));
        assert!(!is_allowed_mime("image/gif"));
        assert_eq!(extension_for_mime("image/jpeg"), Some(".jpg"));
        assert_eq!(extension_for_mime("image/bmp"), None);
    }

    #[test]
    fn test_pending_upload_key_layout() {
        let now = Utc.with_ymd_and_hms(2023, 11, 14, 22, 13, 20).unwrap();
        let key = pending_upload_key(user(), ".jpg", now);

        assert!(key.starts_with("pending/submissions/550e8400-e29b-41d4-a716-446655440000/1700000000_"));
        assert!(key.ends_with(".jpg"));
        assert!(is_under_pending_prefix(&key, user()));
        assert!(is_under_pending_prefix(&format!("/{key}"), user()));
        assert!(!is_under_pending_prefix(&key, Uuid::new_v4()));
    }

    #[test]
    fn test_direct_upload_key_layout() {
        let cafe = Uuid::new_v4();
        let now = Utc.with_ymd_and_hms(2023, 11, 14, 22, 13, 20).unwrap();
        let key = direct_upload_key(cafe, PhotoKind::Menu, ".png", now);

        assert!(key.starts_with(&format!("cafes/{cafe}/menu/1700000000_")));
        assert!(is_under_cafe_prefix(&key, cafe, PhotoKind::Menu));
        assert!(!is_under_cafe_prefix(&key, cafe, PhotoKind::Cafe));
        assert!(!is_optimized_key(&key));
    }

    #[test]
    fn test_canonical_key_layout() {
        let cafe = Uuid::new_v4();
        let now = Utc.timestamp_opt(1_700_000_000, 123).unwrap();
        let key = canonical_key(cafe, PhotoKind::Cafe, b"hello", ".jpg", now);

        // sha256("hello") = 2cf24dba5fb0a30e...
        assert_eq!(
            key,
            format!("cafes/{cafe}/cafe/optimized/1700000000000000123_2cf24dba5fb0a30e.jpg")
        );
        assert!(is_optimized_key(&key));
    }

    #[test]
    fn test_variant_keys() {
        let canonical = "cafes/c/cafe/optimized/17_abcdef.jpg";
        assert_eq!(
            raster_variant_key(canonical, 640),
            "cafes/c/cafe/optimized/17_abcdef_w640.jpg"
        );
        assert_eq!(
            format_variant_key(canonical, 640, "webp"),
            "cafes/c/cafe/optimized/17_abcdef_w640.webp"
        );
    }

    #[test]
    fn test_split_extension_ignores_dots_in_directories() {
        assert_eq!(split_extension("a.b/c/name"), ("a.b/c/name", ""));
        assert_eq!(split_extension("a/name.tar.gz"), ("a/name.tar", ".gz"));
    }

    #[test]
    fn test_photo_kind_round_trip() {
        assert_eq!("menu".parse::<PhotoKind>().unwrap(), PhotoKind::Menu);
        assert!("poster".parse::<PhotoKind>().is_err());
    }
}
