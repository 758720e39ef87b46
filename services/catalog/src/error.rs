//! Error taxonomy shared by the catalog service.
//!
//! Every failure that can reach a caller is an [`AppError`]. Its variants map
//! one-to-one onto the wire `code` of the JSON error envelope:
//!
//! ```text
//! {"error": {"code": "invalid_argument", "message": "...", "details": {...}}}
//! ```
//!
//! Storage and transport failures collapse to `internal` on the wire; the
//! underlying message is logged instead of returned.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::object_store::StoreError;
use crate::optimizer::OptimizeError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{message}")]
    InvalidArgument {
        message: String,
        details: Option<serde_json::Value>,
    },

    #[error("{0}")]
    Unsupported(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("{0}")]
    TooLarge(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("{0} deadline exceeded")]
    DeadlineExceeded(&'static str),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
            details: None,
        }
    }

    pub fn invalid_with(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self::InvalidArgument {
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Wire code for the error envelope
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument { .. } => "invalid_argument",
            Self::Unsupported(_) => "unsupported",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::AlreadyExists(_) => "already_exists",
            Self::TooLarge(_) => "too_large",
            Self::ServiceUnavailable(_) => "service_unavailable",
            Self::DeadlineExceeded(_) => "deadline_exceeded",
            Self::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidArgument { .. } | Self::Unsupported(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) | Self::AlreadyExists(_) => StatusCode::CONFLICT,
            Self::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope<'a> {
    error: ErrorBody<'a>,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let message = match &self {
            AppError::Internal(detail) => {
                error!(error = %detail, "Internal error");
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        let details = match &self {
            AppError::InvalidArgument { details, .. } => details.as_ref(),
            _ => None,
        };

        let body = ErrorEnvelope {
            error: ErrorBody {
                code: self.code(),
                message,
                details,
            },
        };

        let mut response = (self.status(), axum::Json(body)).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        response
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AppError::NotFound("record not found".to_string()),
            other => AppError::Internal(format!("database: {other}")),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => AppError::NotFound(format!("object not found: {key}")),
            StoreError::InvalidArgument(message) => AppError::invalid(message),
            StoreError::Disabled => {
                AppError::ServiceUnavailable("object storage is not configured".to_string())
            }
            StoreError::DeadlineExceeded(op) => AppError::DeadlineExceeded(op),
            StoreError::Backend(message) => AppError::Internal(format!("object store: {message}")),
        }
    }
}

impl From<OptimizeError> for AppError {
    fn from(err: OptimizeError) -> Self {
        match err {
            OptimizeError::TooLarge(message) => AppError::TooLarge(message),
            OptimizeError::Invalid(message) | OptimizeError::UnsupportedMime(message) => {
                AppError::invalid(message)
            }
            OptimizeError::Store(inner) => inner.into(),
            OptimizeError::DeadlineExceeded => AppError::DeadlineExceeded("optimization"),
            OptimizeError::Codec(message) => AppError::Internal(format!("image codec: {message}")),
        }
    }
}

/// Postgres SQLSTATE of a database error, if any
pub(crate) fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.code().map(|code| code.into_owned()),
        _ => None,
    }
}

pub(crate) const UNIQUE_VIOLATION: &str = "23505";
pub(crate) const FOREIGN_KEY_VIOLATION: &str = "23503";
