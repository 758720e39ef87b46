use crate::error::{sqlstate, AppError, AppResult, FOREIGN_KEY_VIOLATION};
use crate::submissions::{
    ActionType, EntityType, Submission, SubmissionPayload, SubmissionStatus,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::{FromRow, PgConnection};
use tracing::{debug, instrument};
use uuid::Uuid;

/// Columns shared by every submission query
const SUBMISSION_COLUMNS: &str = r#"
    s.id, s.author_user_id, s.entity_type, s.action_type, s.target_id, s.payload,
    s.status, s.moderator_id, s.moderator_comment, s.created_at, s.updated_at,
    s.decided_at
"#;

#[derive(Debug, FromRow)]
struct SubmissionRow {
    id: Uuid,
    author_user_id: Uuid,
    entity_type: String,
    action_type: String,
    target_id: Option<Uuid>,
    payload: serde_json::Value,
    status: String,
    moderator_id: Option<Uuid>,
    moderator_comment: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    decided_at: Option<DateTime<Utc>>,
    author_label: Option<String>,
}

impl TryFrom<SubmissionRow> for Submission {
    type Error = AppError;

    fn try_from(row: SubmissionRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let corrupt = |e: AppError| AppError::internal(format!("submission {id}: {e}"));
        Ok(Submission {
            id,
            author_user_id: row.author_user_id,
            entity_type: row.entity_type.parse::<EntityType>().map_err(corrupt)?,
            action_type: row.action_type.parse::<ActionType>().map_err(corrupt)?,
            target_id: row.target_id,
            payload: row.payload,
            status: row.status.parse::<SubmissionStatus>().map_err(corrupt)?,
            moderator_id: row.moderator_id,
            moderator_comment: row.moderator_comment,
            created_at: row.created_at,
            updated_at: row.updated_at,
            decided_at: row.decided_at,
            author_label: row.author_label,
        })
    }
}

fn into_submissions(rows: Vec<SubmissionRow>) -> AppResult<Vec<Submission>> {
    rows.into_iter().map(Submission::try_from).collect()
}

/// Listing filter for the moderation queue
#[derive(Debug, Clone, Default)]
pub struct ModerationFilter {
    /// Defaults to pending
    pub status: Option<SubmissionStatus>,
    pub entity_type: Option<EntityType>,
}

/// Submissions table access
#[derive(Clone)]
pub struct SubmissionStore {
    pool: PgPool,
}

impl SubmissionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[instrument(skip(self, payload), fields(entity_type = %payload.entity_type()))]
    pub async fn insert(
        &self,
        author: Uuid,
        target_id: Option<Uuid>,
        payload: &SubmissionPayload,
    ) -> AppResult<Submission> {
        let row = sqlx::query_as::<_, SubmissionRow>(&format!(
            r#"
            INSERT INTO submissions AS s (
                id, author_user_id, entity_type, action_type, target_id, payload, status
            ) VALUES ($1, $2, $3, $4, $5, $6, 'pending')
            RETURNING {SUBMISSION_COLUMNS}, NULL::text AS author_label
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(author)
        .bind(payload.entity_type().as_str())
        .bind(payload.action_type().as_str())
        .bind(target_id)
        .bind(payload.to_value()?)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match sqlstate(&e).as_deref() {
            Some(FOREIGN_KEY_VIOLATION) => AppError::Unauthorized(format!("unknown user: {author}")),
            _ => e.into(),
        })?;

        let submission = Submission::try_from(row)?;
        debug!(submission_id = %submission.id, "Submission stored");
        Ok(submission)
    }

    /// Newest first
    pub async fn list_by_author(&self, author: Uuid, limit: i64) -> AppResult<Vec<Submission>> {
        let rows = sqlx::query_as::<_, SubmissionRow>(&format!(
            r#"
            SELECT {SUBMISSION_COLUMNS}, NULL::text AS author_label
            FROM submissions s
            WHERE s.author_user_id = $1
            ORDER BY s.created_at DESC, s.id DESC
            LIMIT $2
            "#
        ))
        .bind(author)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        into_submissions(rows)
    }

    /// Oldest first, with the author's display label
    pub async fn list_for_moderation(
        &self,
        filter: &ModerationFilter,
        limit: i64,
    ) -> AppResult<Vec<Submission>> {
        let status = filter.status.unwrap_or(SubmissionStatus::Pending);
        let rows = sqlx::query_as::<_, SubmissionRow>(&format!(
            r#"
            SELECT {SUBMISSION_COLUMNS},
                   COALESCE(NULLIF(btrim(u.display_name), ''),
                            NULLIF(btrim(u.email), ''),
                            s.author_user_id::text) AS author_label
            FROM submissions s
            LEFT JOIN users u ON u.id = s.author_user_id
            WHERE s.status = $1
              AND ($2::text IS NULL OR s.entity_type = $2)
            ORDER BY s.created_at ASC, s.id ASC
            LIMIT $3
            "#
        ))
        .bind(status.as_str())
        .bind(filter.entity_type.map(|e| e.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        into_submissions(rows)
    }

    pub async fn get(&self, id: Uuid) -> AppResult<Submission> {
        let row = sqlx::query_as::<_, SubmissionRow>(&format!(
            r#"
            SELECT {SUBMISSION_COLUMNS},
                   COALESCE(NULLIF(btrim(u.display_name), ''),
                            NULLIF(btrim(u.email), ''),
                            s.author_user_id::text) AS author_label
            FROM submissions s
            LEFT JOIN users u ON u.id = s.author_user_id
            WHERE s.id = $1
            "#
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Submission::try_from)
            .transpose()?
            .ok_or_else(|| AppError::NotFound(format!("submission not found: {id}")))
    }
}

/// Lock a submission row for the rest of the transaction
pub async fn lock_for_decision(conn: &mut PgConnection, id: Uuid) -> AppResult<Submission> {
    let row = sqlx::query_as::<_, SubmissionRow>(&format!(
        r#"
        SELECT {SUBMISSION_COLUMNS}, NULL::text AS author_label
        FROM submissions s
        WHERE s.id = $1
        FOR UPDATE
        "#
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(Submission::try_from)
        .transpose()?
        .ok_or_else(|| AppError::NotFound(format!("submission not found: {id}")))
}

/// Move a locked pending submission to its decided status
pub async fn record_decision(
    conn: &mut PgConnection,
    id: Uuid,
    status: SubmissionStatus,
    actor: Uuid,
    comment: Option<&str>,
) -> AppResult<Submission> {
    let row = sqlx::query_as::<_, SubmissionRow>(&format!(
        r#"
        UPDATE submissions AS s
        SET status = $2,
            moderator_id = $3,
            moderator_comment = $4,
            decided_at = NOW(),
            updated_at = NOW()
        WHERE s.id = $1 AND s.status = 'pending'
        RETURNING {SUBMISSION_COLUMNS}, NULL::text AS author_label
        "#
    ))
    .bind(id)
    .bind(status.as_str())
    .bind(actor)
    .bind(comment)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(Submission::try_from)
        .transpose()?
        .ok_or_else(|| AppError::Conflict(format!("submission {id} is no longer pending")))
}

/// Append to the moderation audit log
pub async fn insert_event(
    conn: &mut PgConnection,
    submission_id: Uuid,
    actor: Uuid,
    event_type: SubmissionStatus,
    comment: Option<&str>,
) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO moderation_events (submission_id, actor_user_id, event_type, comment)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(submission_id)
    .bind(actor)
    .bind(event_type.as_str())
    .bind(comment)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(status: &str) -> SubmissionRow {
        SubmissionRow {
            id: Uuid::new_v4(),
            author_user_id: Uuid::new_v4(),
            entity_type: "cafe_photo".to_string(),
            action_type: "create".to_string(),
            target_id: Some(Uuid::new_v4()),
            payload: serde_json::json!({ "object_keys": [] }),
            status: status.to_string(),
            moderator_id: None,
            moderator_comment: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            decided_at: None,
            author_label: Some("Anna".to_string()),
        }
    }

    #[test]
    fn test_row_conversion() {
        let submission = Submission::try_from(row("pending")).unwrap();
        assert_eq!(submission.entity_type, EntityType::CafePhoto);
        assert_eq!(submission.action_type, ActionType::Create);
        assert_eq!(submission.status, SubmissionStatus::Pending);
        assert_eq!(submission.author_label.as_deref(), Some("Anna"));
    }

    #[test]
    fn test_corrupt_row_is_internal() {
        let err = Submission::try_from(row("archived")).unwrap_err();
        assert_eq!(err.code(), "internal");
    }
}
