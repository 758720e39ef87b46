//! Optimize photos that were attached with their staged upload key.
//!
//! Each photo is optimized outside any transaction; the row is then swapped to
//! the canonical key with a single conditional update. The staged source is
//! deleted only after the swap succeeds, and the new object is removed again
//! when the swap fails or the row changed underneath us.

use crate::catalog_store::{CafePhoto, CatalogStore};
use crate::error::AppResult;
use crate::optimizer::{OptimizeRequest, PhotoOptimizer};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhotoOutcome {
    /// Row now points at the optimized object
    Rewritten,
    /// Already canonical; nothing written
    Unchanged,
    /// Row no longer referenced the source key
    Superseded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillSummary {
    pub scanned: usize,
    pub rewritten: usize,
    pub unchanged: usize,
    pub superseded: usize,
    pub failed: usize,
}

impl BackfillSummary {
    fn record(&mut self, photo_id: Uuid, result: AppResult<PhotoOutcome>) {
        self.scanned += 1;
        match result {
            Ok(PhotoOutcome::Rewritten) => self.rewritten += 1,
            Ok(PhotoOutcome::Unchanged) => self.unchanged += 1,
            Ok(PhotoOutcome::Superseded) => self.superseded += 1,
            Err(e) => {
                warn!(photo_id = %photo_id, error = %e, "Photo optimization failed");
                self.failed += 1;
            }
        }
    }
}

pub struct PhotoBackfill {
    catalog: CatalogStore,
    optimizer: Arc<PhotoOptimizer>,
}

impl PhotoBackfill {
    pub fn new(catalog: CatalogStore, optimizer: Arc<PhotoOptimizer>) -> Self {
        Self { catalog, optimizer }
    }

    /// Optimize one photo and point its row at the result
    #[instrument(skip(self, photo), fields(photo_id = %photo.id, object_key = %photo.object_key))]
    pub async fn optimize_photo(&self, photo: &CafePhoto) -> AppResult<PhotoOutcome> {
        let optimized = self
            .optimizer
            .optimize(&OptimizeRequest {
                cafe_id: photo.cafe_id,
                kind: photo.photo_kind()?,
                source_key: photo.object_key.clone(),
                declared_mime: photo.mime_type.clone(),
                declared_size: photo.size_bytes,
                delete_source: false,
            })
            .await?;

        if !optimized.rewritten || optimized.object_key == photo.object_key {
            return Ok(PhotoOutcome::Unchanged);
        }

        let swapped = self
            .catalog
            .replace_photo_object(
                photo.id,
                &photo.object_key,
                &optimized.object_key,
                &optimized.mime_type,
                optimized.size_bytes,
            )
            .await;

        match swapped {
            Ok(true) => {
                if let Err(e) = self.optimizer.store().delete(&photo.object_key).await {
                    warn!(error = %e, "Failed to delete photo source");
                }
                Ok(PhotoOutcome::Rewritten)
            }
            Ok(false) => {
                self.optimizer.discard(&optimized).await;
                Ok(PhotoOutcome::Superseded)
            }
            Err(e) => {
                self.optimizer.discard(&optimized).await;
                Err(e)
            }
        }
    }

    /// Optimize a known set of photos with bounded concurrency
    pub async fn optimize_all(&self, photos: Vec<CafePhoto>, concurrency: usize) -> BackfillSummary {
        let results: Vec<(Uuid, AppResult<PhotoOutcome>)> = stream::iter(photos)
            .map(|photo| async move { (photo.id, self.optimize_photo(&photo).await) })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let mut summary = BackfillSummary::default();
        for (photo_id, result) in results {
            summary.record(photo_id, result);
        }
        summary
    }

    /// Walk every photo still stored under a staged key
    pub async fn run(
        &self,
        batch_size: i64,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> AppResult<BackfillSummary> {
        let mut summary = BackfillSummary::default();
        let mut after = None;

        loop {
            if cancel.is_cancelled() {
                info!("Backfill cancelled");
                break;
            }

            let batch = self
                .catalog
                .list_photos_pending_optimization(after, batch_size)
                .await?;
            let Some(last) = batch.last() else {
                break;
            };
            after = Some(last.id);

            let batch_summary = self.optimize_all(batch, concurrency).await;
            summary.scanned += batch_summary.scanned;
            summary.rewritten += batch_summary.rewritten;
            summary.unchanged += batch_summary.unchanged;
            summary.superseded += batch_summary.superseded;
            summary.failed += batch_summary.failed;

            info!(
                scanned = summary.scanned,
                rewritten = summary.rewritten,
                failed = summary.failed,
                "Backfill progress"
            );
        }

        Ok(summary)
    }

    /// Optimize photos attached by an approval once the decision has committed
    pub fn spawn_after_approval(self: &Arc<Self>, photos: Vec<CafePhoto>) -> Option<JoinHandle<()>> {
        if photos.is_empty() {
            return None;
        }

        let backfill = Arc::clone(self);
        let concurrency = photos.len();
        Some(tokio::spawn(async move {
            let summary = backfill.optimize_all(photos, concurrency).await;
            if summary.failed > 0 {
                error!(failed = summary.failed, "Post-approval optimization incomplete");
            } else {
                info!(rewritten = summary.rewritten, "Post-approval optimization finished");
            }
        }))
    }
}
