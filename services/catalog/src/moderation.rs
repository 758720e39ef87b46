//! Moderation engine.
//!
//! ```text
//!                      approve ──► apply payload to catalog
//!                    ┌─────────► approved
//!   create ──► pending ──reject──► rejected
//!                    ├─request-changes─► needs_changes
//!                    └─cancel (author)─► cancelled
//! ```
//!
//! Every decision runs in one transaction: the submission row is locked with
//! `SELECT … FOR UPDATE`, the payload is applied on approval, the row is
//! updated and an audit event is appended. Any failure rolls all of it back.

use crate::catalog_store::{self, CafePhoto, NewCafePhoto};
use crate::error::{AppError, AppResult};
use crate::object_store::{ObjectStore, StoreError};
use crate::photo_keys::{self, PhotoKind};
use crate::submission_store::{self, ModerationFilter, SubmissionStore};
use crate::submissions::{photo_slot, Decision, Submission, SubmissionPayload};
use crate::uploads::verify_uploaded_object;
use sqlx::PgConnection;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

pub const MINE_LIMIT: i64 = 200;
pub const MODERATION_LIMIT: i64 = 300;

/// Result of a committed decision
#[derive(Debug, Clone)]
pub struct DecisionOutcome {
    pub submission: Submission,
    /// Photos attached by an approval
    pub inserted_photos: Vec<CafePhoto>,
}

pub struct ModerationService {
    submissions: SubmissionStore,
    store: Arc<dyn ObjectStore>,
    max_upload_bytes: i64,
    approval_timeout: Duration,
}

impl ModerationService {
    pub fn new(
        submissions: SubmissionStore,
        store: Arc<dyn ObjectStore>,
        max_upload_bytes: i64,
        approval_timeout: Duration,
    ) -> Self {
        Self {
            submissions,
            store,
            max_upload_bytes,
            approval_timeout,
        }
    }

    /// Validate and store a new pending submission
    #[instrument(skip(self, payload), fields(entity_type = %payload.entity_type()))]
    pub async fn create_submission(
        &self,
        author: Uuid,
        target_id: Option<Uuid>,
        payload: SubmissionPayload,
    ) -> AppResult<Submission> {
        let payload = payload.normalized(author)?;

        let target_id = if payload.requires_target() {
            let target = target_id.ok_or_else(|| AppError::invalid("target_id is required"))?;
            let mut conn = self.submissions.pool().acquire().await?;
            catalog_store::ensure_cafe_exists(&mut conn, target).await?;
            Some(target)
        } else {
            None
        };

        for (_, key) in payload.photo_keys() {
            verify_uploaded_object(self.store.as_ref(), key, self.max_upload_bytes).await?;
        }

        let submission = self.submissions.insert(author, target_id, &payload).await?;

        metrics::counter!(
            "catalog.submissions.created",
            "entity_type" => submission.entity_type.as_str()
        )
        .increment(1);
        info!(submission_id = %submission.id, author = %author, "Submission created");

        Ok(submission)
    }

    /// Caller's own submissions, newest first
    pub async fn list_mine(&self, author: Uuid) -> AppResult<Vec<Submission>> {
        self.submissions.list_by_author(author, MINE_LIMIT).await
    }

    /// Moderation queue, oldest first
    pub async fn list_for_moderation(&self, filter: &ModerationFilter) -> AppResult<Vec<Submission>> {
        self.submissions.list_for_moderation(filter, MODERATION_LIMIT).await
    }

    pub async fn get(&self, id: Uuid) -> AppResult<Submission> {
        self.submissions.get(id).await
    }

    /// Author withdraws a pending submission
    pub async fn cancel(&self, id: Uuid, author: Uuid, comment: Option<&str>) -> AppResult<DecisionOutcome> {
        self.decide(id, author, Decision::Cancel, comment).await
    }

    /// Move a pending submission out of `pending`, applying it on approval
    #[instrument(skip(self, comment))]
    pub async fn decide(
        &self,
        id: Uuid,
        actor: Uuid,
        decision: Decision,
        comment: Option<&str>,
    ) -> AppResult<DecisionOutcome> {
        let comment = comment.map(str::trim).filter(|c| !c.is_empty());
        if decision.requires_comment() && comment.is_none() {
            return Err(AppError::invalid("comment is required"));
        }

        let outcome = tokio::time::timeout(
            self.approval_timeout,
            self.decide_in_transaction(id, actor, decision, comment),
        )
        .await
        .map_err(|_| AppError::DeadlineExceeded("decision"))??;

        metrics::counter!(
            "catalog.submissions.decided",
            "status" => decision.status().as_str()
        )
        .increment(1);
        info!(
            submission_id = %id,
            status = %outcome.submission.status,
            photos = outcome.inserted_photos.len(),
            "Submission decided"
        );

        Ok(outcome)
    }

    async fn decide_in_transaction(
        &self,
        id: Uuid,
        actor: Uuid,
        decision: Decision,
        comment: Option<&str>,
    ) -> AppResult<DecisionOutcome> {
        let mut tx = self.submissions.pool().begin().await?;

        let submission = submission_store::lock_for_decision(&mut tx, id).await?;
        if submission.status.is_terminal() {
            return Err(AppError::Conflict(format!(
                "submission {id} is already {}",
                submission.status
            )));
        }
        if decision == Decision::Cancel && submission.author_user_id != actor {
            return Err(AppError::Forbidden(
                "only the author can cancel a submission".to_string(),
            ));
        }

        let inserted_photos = if decision == Decision::Approve {
            self.apply(&mut tx, &submission).await?
        } else {
            Vec::new()
        };

        let status = decision.status();
        let submission =
            submission_store::record_decision(&mut tx, id, status, actor, comment).await?;
        submission_store::insert_event(&mut tx, id, actor, status, comment).await?;

        tx.commit().await?;

        Ok(DecisionOutcome {
            submission,
            inserted_photos,
        })
    }

    /// Apply an approved submission's payload inside the decision transaction
    async fn apply(
        &self,
        conn: &mut PgConnection,
        submission: &Submission,
    ) -> AppResult<Vec<CafePhoto>> {
        let author = submission.author_user_id;
        let payload = SubmissionPayload::decode(
            submission.entity_type,
            submission.action_type,
            &submission.payload,
        )?
        .normalized(author)?;

        match payload {
            SubmissionPayload::CafeCreate(cafe) => {
                let cafe_id = catalog_store::insert_cafe(conn, &cafe.new_cafe()).await?;
                let mut photos = self
                    .insert_photos(conn, cafe_id, PhotoKind::Cafe, &cafe.photo_object_keys, author)
                    .await?;
                photos.extend(
                    self.insert_photos(conn, cafe_id, PhotoKind::Menu, &cafe.menu_photo_object_keys, author)
                        .await?,
                );
                Ok(photos)
            }
            SubmissionPayload::DescriptionUpdate(update) => {
                let cafe_id = target_of(submission)?;
                catalog_store::update_cafe_description(conn, cafe_id, &update.description).await?;
                Ok(Vec::new())
            }
            SubmissionPayload::CafePhotos(batch) => {
                let cafe_id = target_of(submission)?;
                catalog_store::ensure_cafe_exists(conn, cafe_id).await?;
                self.insert_photos(conn, cafe_id, PhotoKind::Cafe, &batch.object_keys, author)
                    .await
            }
            SubmissionPayload::MenuPhotos(batch) => {
                let cafe_id = target_of(submission)?;
                catalog_store::ensure_cafe_exists(conn, cafe_id).await?;
                self.insert_photos(conn, cafe_id, PhotoKind::Menu, &batch.object_keys, author)
                    .await
            }
        }
    }

    /// Append photos after the cafe's existing ones. Keys already attached to
    /// the cafe are skipped, so re-approving the same keys adds nothing.
    async fn insert_photos(
        &self,
        conn: &mut PgConnection,
        cafe_id: Uuid,
        kind: PhotoKind,
        keys: &[String],
        uploaded_by: Uuid,
    ) -> AppResult<Vec<CafePhoto>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let count_before = catalog_store::count_cafe_photos(conn, cafe_id).await?;
        let mut inserted = Vec::with_capacity(keys.len());

        for key in keys {
            let key = photo_keys::trim_key(key);
            if key.is_empty() {
                continue;
            }

            let info = self.store.head(key).await.map_err(|e| match e {
                StoreError::NotFound(_) => {
                    AppError::NotFound(format!("photo object is missing: {key}"))
                }
                other => other.into(),
            })?;
            let mime = photo_keys::normalize_mime(&info.mime_type);
            if !photo_keys::is_allowed_mime(&mime) {
                return Err(AppError::invalid(format!("unsupported mime type: {mime}")));
            }
            if info.size_bytes <= 0 {
                return Err(AppError::invalid(format!("photo object is empty: {key}")));
            }

            let (position, is_cover) = photo_slot(kind, count_before, inserted.len());
            if is_cover {
                catalog_store::clear_cafe_covers(conn, cafe_id).await?;
            }

            let photo = NewCafePhoto {
                cafe_id,
                kind,
                object_key: key,
                mime_type: &mime,
                size_bytes: info.size_bytes,
                position,
                is_cover,
                uploaded_by: Some(uploaded_by),
            };
            match catalog_store::insert_cafe_photo(conn, &photo).await {
                Ok(photo) => inserted.push(photo),
                Err(AppError::AlreadyExists(_)) => {
                    debug!(cafe_id = %cafe_id, key = %key, "Photo already attached, skipping");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(inserted)
    }
}

fn target_of(submission: &Submission) -> AppResult<Uuid> {
    submission
        .target_id
        .ok_or_else(|| AppError::invalid(format!("submission {} has no target_id", submission.id)))
}
