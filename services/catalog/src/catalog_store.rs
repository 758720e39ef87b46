use crate::config::DatabaseConfig;
use crate::error::{sqlstate, AppError, AppResult, FOREIGN_KEY_VIOLATION, UNIQUE_VIOLATION};
use crate::photo_keys::PhotoKind;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, PgConnection};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Stored cafe photo
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CafePhoto {
    pub id: Uuid,
    pub cafe_id: Uuid,
    /// `cafe` or `menu`
    pub kind: String,
    pub object_key: String,
    pub mime_type: String,
    pub size_bytes: i64,
    /// Ordering within the cafe, 1-based for appended photos
    pub position: i32,
    pub is_cover: bool,
    pub uploaded_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl CafePhoto {
    pub fn photo_kind(&self) -> AppResult<PhotoKind> {
        self.kind
            .parse()
            .map_err(|e: String| AppError::internal(format!("photo {}: {e}", self.id)))
    }
}

/// Cafe row to insert
#[derive(Debug, Clone, PartialEq)]
pub struct NewCafe {
    pub name: String,
    pub address: String,
    pub description: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub amenities: Vec<String>,
}

/// Photo row to insert
#[derive(Debug, Clone)]
pub struct NewCafePhoto<'a> {
    pub cafe_id: Uuid,
    pub kind: PhotoKind,
    pub object_key: &'a str,
    pub mime_type: &'a str,
    pub size_bytes: i64,
    pub position: i32,
    pub is_cover: bool,
    pub uploaded_by: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    User,
    Moderator,
    Admin,
}

impl UserRole {
    pub fn can_moderate(&self) -> bool {
        matches!(self, UserRole::Moderator | UserRole::Admin)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::User => "user",
            UserRole::Moderator => "moderator",
            UserRole::Admin => "admin",
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(UserRole::User),
            "moderator" => Ok(UserRole::Moderator),
            "admin" => Ok(UserRole::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Postgres-backed catalog: cafes, photos and users
#[derive(Clone)]
pub struct CatalogStore {
    pool: PgPool,
}

impl CatalogStore {
    /// Create a store with its own connection pool
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    pub async fn ping(&self) -> AppResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::ServiceUnavailable(format!("database unreachable: {e}")))?;
        Ok(())
    }

    /// Role of a known user; `None` when the user does not exist
    pub async fn user_role(&self, user_id: Uuid) -> AppResult<Option<UserRole>> {
        let role: Option<String> = sqlx::query_scalar("SELECT role FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        role.map(|r| r.parse::<UserRole>().map_err(AppError::internal))
            .transpose()
    }

    /// Photos still stored under a staged key, keyset-paged by id. Keys under
    /// the photo's own `cafes/{cafe_id}/{kind}/` prefix have already been
    /// through the optimizer (rewritten or deliberately kept) and are skipped.
    #[instrument(skip(self))]
    pub async fn list_photos_pending_optimization(
        &self,
        after: Option<Uuid>,
        limit: i64,
    ) -> AppResult<Vec<CafePhoto>> {
        let photos = sqlx::query_as::<_, CafePhoto>(
            r#"
            SELECT id, cafe_id, kind, object_key, mime_type, size_bytes,
                   position, is_cover, uploaded_by, created_at
            FROM cafe_photos
            WHERE object_key NOT LIKE 'cafes/' || cafe_id::text || '/' || kind || '/%'
              AND ($1::uuid IS NULL OR id > $1)
            ORDER BY id
            LIMIT $2
            "#,
        )
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        debug!(count = photos.len(), "Listed photos pending optimization");
        Ok(photos)
    }

    /// Point a photo at its optimized object if it still references `old_key`.
    /// Returns false when the row moved on in the meantime.
    #[instrument(skip(self))]
    pub async fn replace_photo_object(
        &self,
        photo_id: Uuid,
        old_key: &str,
        new_key: &str,
        mime_type: &str,
        size_bytes: i64,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE cafe_photos
            SET object_key = $3, mime_type = $4, size_bytes = $5
            WHERE id = $1 AND object_key = $2
            "#,
        )
        .bind(photo_id)
        .bind(old_key)
        .bind(new_key)
        .bind(mime_type)
        .bind(size_bytes)
        .execute(&self.pool)
        .await
        .map_err(|e| unique_as_already_exists(e, "photo object key already in use"))?;

        Ok(result.rows_affected() == 1)
    }
}

fn unique_as_already_exists(err: sqlx::Error, message: &str) -> AppError {
    if sqlstate(&err).as_deref() == Some(UNIQUE_VIOLATION) {
        AppError::AlreadyExists(message.to_string())
    } else {
        err.into()
    }
}

/// Fail with `not_found` unless the cafe exists. The row stays locked until
/// the transaction ends, which serializes photo appends per cafe.
pub async fn ensure_cafe_exists(conn: &mut PgConnection, cafe_id: Uuid) -> AppResult<()> {
    let found: Option<Uuid> = sqlx::query_scalar("SELECT id FROM cafes WHERE id = $1 FOR UPDATE")
        .bind(cafe_id)
        .fetch_optional(&mut *conn)
        .await?;

    found
        .map(|_| ())
        .ok_or_else(|| AppError::NotFound(format!("cafe not found: {cafe_id}")))
}

#[instrument(skip(conn, cafe), fields(name = %cafe.name))]
pub async fn insert_cafe(conn: &mut PgConnection, cafe: &NewCafe) -> AppResult<Uuid> {
    // ST_MakePoint takes (x, y) = (lng, lat)
    let id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO cafes (
            id, name, address, description, latitude, longitude, amenities, location
        ) VALUES (
            $1, $2, $3, $4, $5, $6, $7,
            ST_SetSRID(ST_MakePoint($6, $5), 4326)::geography
        )
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&cafe.name)
    .bind(&cafe.address)
    .bind(&cafe.description)
    .bind(cafe.latitude)
    .bind(cafe.longitude)
    .bind(&cafe.amenities)
    .fetch_one(&mut *conn)
    .await?;

    info!(cafe_id = %id, "Cafe inserted");
    Ok(id)
}

/// Returns the saved description
pub async fn update_cafe_description(
    conn: &mut PgConnection,
    cafe_id: Uuid,
    description: &str,
) -> AppResult<String> {
    let saved: Option<Option<String>> = sqlx::query_scalar(
        r#"
        UPDATE cafes SET description = $2, updated_at = NOW()
        WHERE id = $1
        RETURNING description
        "#,
    )
    .bind(cafe_id)
    .bind(description)
    .fetch_optional(&mut *conn)
    .await?;

    match saved {
        Some(description) => Ok(description.unwrap_or_default()),
        None => Err(AppError::NotFound(format!("cafe not found: {cafe_id}"))),
    }
}

/// Insert a photo row. A duplicate (cafe_id, object_key) yields `already_exists`
/// without aborting the surrounding transaction.
#[instrument(skip(conn, photo), fields(cafe_id = %photo.cafe_id, object_key = %photo.object_key))]
pub async fn insert_cafe_photo(
    conn: &mut PgConnection,
    photo: &NewCafePhoto<'_>,
) -> AppResult<CafePhoto> {
    let inserted = sqlx::query_as::<_, CafePhoto>(
        r#"
        INSERT INTO cafe_photos (
            id, cafe_id, kind, object_key, mime_type, size_bytes,
            position, is_cover, uploaded_by
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (cafe_id, object_key) DO NOTHING
        RETURNING id, cafe_id, kind, object_key, mime_type, size_bytes,
                  position, is_cover, uploaded_by, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(photo.cafe_id)
    .bind(photo.kind.as_str())
    .bind(photo.object_key)
    .bind(photo.mime_type)
    .bind(photo.size_bytes)
    .bind(photo.position)
    .bind(photo.is_cover)
    .bind(photo.uploaded_by)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| match sqlstate(&e).as_deref() {
        Some(FOREIGN_KEY_VIOLATION) => {
            AppError::NotFound(format!("cafe not found: {}", photo.cafe_id))
        }
        _ => e.into(),
    })?;

    inserted.ok_or_else(|| {
        AppError::AlreadyExists(format!("photo already attached: {}", photo.object_key))
    })
}

pub async fn clear_cafe_covers(conn: &mut PgConnection, cafe_id: Uuid) -> AppResult<u64> {
    let result = sqlx::query("UPDATE cafe_photos SET is_cover = FALSE WHERE cafe_id = $1 AND is_cover")
        .bind(cafe_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

/// Photos of every kind attached to a cafe
pub async fn count_cafe_photos(conn: &mut PgConnection, cafe_id: Uuid) -> AppResult<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cafe_photos WHERE cafe_id = $1")
        .bind(cafe_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_role_parsing() {
        assert_eq!("admin".parse::<UserRole>().unwrap(), UserRole::Admin);
        assert!("root".parse::<UserRole>().is_err());
        assert!(UserRole::Moderator.can_moderate());
        assert!(UserRole::Admin.can_moderate());
        assert!(!UserRole::User.can_moderate());
    }

    #[test]
    fn test_photo_kind_from_row() {
        let photo = CafePhoto {
            id: Uuid::new_v4(),
            cafe_id: Uuid::new_v4(),
            kind: "menu".to_string(),
            object_key: "cafes/c/menu/1_a.jpg".to_string(),
            mime_type: "image/jpeg".to_string(),
            size_bytes: 10,
            position: 1,
            is_cover: false,
            uploaded_by: None,
            created_at: Utc::now(),
        };
        assert_eq!(photo.photo_kind().unwrap(), PhotoKind::Menu);

        let broken = CafePhoto {
            kind: "poster".to_string(),
            ..photo
        };
        assert_eq!(broken.photo_kind().unwrap_err().code(), "internal");
    }
}
