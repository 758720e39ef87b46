//! Two-phase photo uploads.
//!
//! Clients first ask for a presigned PUT, upload directly to the bucket, then
//! reference the key. Staged keys live under the author's pending prefix and
//! are attached through moderation; admins may also upload straight into a
//! cafe gallery, in which case the photo is optimized and attached at once.

use crate::catalog_store::{self, CafePhoto, CatalogStore, NewCafePhoto};
use crate::error::{AppError, AppResult};
use crate::object_store::{ObjectInfo, ObjectStore, PresignedPut, StoreError};
use crate::optimizer::{OptimizeRequest, PhotoOptimizer};
use crate::photo_keys::{self, PhotoKind};
use crate::submissions::photo_slot;
use crate::variants::VariantReport;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Presigned PUT plus the key the client must reference afterwards
#[derive(Debug, Clone, Serialize)]
pub struct UploadTicket {
    pub object_key: String,
    pub content_type: String,
    #[serde(flatten)]
    pub presigned: PresignedPut,
}

/// A photo attached by a direct upload
#[derive(Debug, Clone, Serialize)]
pub struct AttachedPhoto {
    pub photo: CafePhoto,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub variants: VariantReport,
}

/// Normalized mime type and extension for an upload request
pub fn validate_upload_request(
    content_type: &str,
    size_bytes: i64,
    max_upload_bytes: i64,
) -> AppResult<(String, &'static str)> {
    let mime = photo_keys::normalize_mime(content_type);
    let ext = photo_keys::extension_for_mime(&mime).ok_or_else(|| {
        AppError::invalid_with(
            "unsupported content_type",
            json!({ "allowed": photo_keys::ALLOWED_MIME_TYPES }),
        )
    })?;
    check_size(size_bytes, max_upload_bytes)?;
    Ok((mime, ext))
}

fn check_size(size_bytes: i64, max_upload_bytes: i64) -> AppResult<()> {
    if size_bytes <= 0 {
        return Err(AppError::invalid("size_bytes must be positive"));
    }
    if size_bytes > max_upload_bytes {
        return Err(AppError::TooLarge(format!(
            "upload is {size_bytes} bytes, above {max_upload_bytes} bytes"
        )));
    }
    Ok(())
}

/// HEAD an uploaded object and check its size and mime type
pub async fn verify_uploaded_object(
    store: &dyn ObjectStore,
    key: &str,
    max_upload_bytes: i64,
) -> AppResult<ObjectInfo> {
    let info = match store.head(key).await {
        Ok(info) => info,
        Err(StoreError::NotFound(_)) => {
            return Err(AppError::invalid_with(
                "object_key was not uploaded",
                json!({ "object_key": key }),
            ))
        }
        Err(e) => return Err(e.into()),
    };

    check_size(info.size_bytes, max_upload_bytes)?;
    let mime = photo_keys::normalize_mime(&info.mime_type);
    if !photo_keys::is_allowed_mime(&mime) {
        return Err(AppError::invalid_with(
            "unsupported mime type",
            json!({ "object_key": key, "mime_type": mime }),
        ));
    }

    Ok(ObjectInfo {
        size_bytes: info.size_bytes,
        mime_type: mime,
    })
}

pub struct UploadService {
    store: Arc<dyn ObjectStore>,
    catalog: CatalogStore,
    optimizer: Arc<PhotoOptimizer>,
    max_upload_bytes: i64,
    presign_timeout: Duration,
}

impl UploadService {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        catalog: CatalogStore,
        optimizer: Arc<PhotoOptimizer>,
        max_upload_bytes: i64,
        presign_timeout: Duration,
    ) -> Self {
        Self {
            store,
            catalog,
            optimizer,
            max_upload_bytes,
            presign_timeout,
        }
    }

    async fn presign(&self, key: String, mime: String) -> AppResult<UploadTicket> {
        let presigned = tokio::time::timeout(self.presign_timeout, self.store.presign_put(&key, &mime))
            .await
            .map_err(|_| AppError::DeadlineExceeded("presign"))??;

        Ok(UploadTicket {
            object_key: key,
            content_type: mime,
            presigned,
        })
    }

    /// Presign a staged upload under the caller's pending prefix
    #[instrument(skip(self))]
    pub async fn presign_submission_photo(
        &self,
        user_id: Uuid,
        content_type: &str,
        size_bytes: i64,
    ) -> AppResult<UploadTicket> {
        let (mime, ext) = validate_upload_request(content_type, size_bytes, self.max_upload_bytes)?;
        let key = photo_keys::pending_upload_key(user_id, ext, Utc::now());
        self.presign(key, mime).await
    }

    /// Presign a direct upload into a cafe gallery
    #[instrument(skip(self))]
    pub async fn presign_cafe_photo(
        &self,
        cafe_id: Uuid,
        kind: PhotoKind,
        content_type: &str,
        size_bytes: i64,
    ) -> AppResult<UploadTicket> {
        let (mime, ext) = validate_upload_request(content_type, size_bytes, self.max_upload_bytes)?;
        let key = photo_keys::direct_upload_key(cafe_id, kind, ext, Utc::now());
        self.presign(key, mime).await
    }

    /// Verify, optimize and attach a direct upload. Optimization happens before
    /// the transaction; if the transaction fails the optimized object is removed.
    #[instrument(skip(self))]
    pub async fn finalize_cafe_photo(
        &self,
        admin_id: Uuid,
        cafe_id: Uuid,
        kind: PhotoKind,
        object_key: &str,
    ) -> AppResult<AttachedPhoto> {
        let key = photo_keys::trim_key(object_key);
        if key.is_empty() || !photo_keys::is_under_cafe_prefix(key, cafe_id, kind) {
            return Err(AppError::invalid_with(
                "invalid object_key",
                json!({ "object_key": key }),
            ));
        }

        let info = verify_uploaded_object(self.store.as_ref(), key, self.max_upload_bytes).await?;
        let optimized = self
            .optimizer
            .optimize(&OptimizeRequest {
                cafe_id,
                kind,
                source_key: key.to_string(),
                declared_mime: info.mime_type,
                declared_size: info.size_bytes,
                delete_source: false,
            })
            .await?;

        let photo = match self
            .attach(admin_id, cafe_id, kind, &optimized.object_key, &optimized.mime_type, optimized.size_bytes)
            .await
        {
            Ok(photo) => photo,
            Err(e) => {
                self.optimizer.discard(&optimized).await;
                return Err(e);
            }
        };

        if optimized.object_key != key {
            if let Err(e) = self.store.delete(key).await {
                warn!(error = %e, key = %key, "Failed to delete photo source");
            }
        }

        info!(photo_id = %photo.id, object_key = %photo.object_key, "Photo attached");

        Ok(AttachedPhoto {
            photo,
            width: optimized.width,
            height: optimized.height,
            variants: optimized.variants,
        })
    }

    async fn attach(
        &self,
        admin_id: Uuid,
        cafe_id: Uuid,
        kind: PhotoKind,
        object_key: &str,
        mime_type: &str,
        size_bytes: i64,
    ) -> AppResult<CafePhoto> {
        let mut tx = self.catalog.pool().begin().await?;

        catalog_store::ensure_cafe_exists(&mut tx, cafe_id).await?;
        let count = catalog_store::count_cafe_photos(&mut tx, cafe_id).await?;
        let (position, is_cover) = photo_slot(kind, count, 0);
        if is_cover {
            catalog_store::clear_cafe_covers(&mut tx, cafe_id).await?;
        }

        let photo = catalog_store::insert_cafe_photo(
            &mut tx,
            &NewCafePhoto {
                cafe_id,
                kind,
                object_key,
                mime_type,
                size_bytes,
                position,
                is_cover,
                uploaded_by: Some(admin_id),
            },
        )
        .await?;

        tx.commit().await?;
        Ok(photo)
    }
}
