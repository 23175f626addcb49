use http::StatusCode;
use sea_orm::error::DbErr;
use serde::Serialize;

use crate::models::StockKey;

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        DbErr,
    ),

    #[error("Stock not found for {0}")]
    NotFound(StockKey),

    #[error("Insufficient stock for {key}: {available} available")]
    InsufficientStock { key: StockKey, available: i64 },

    #[error("Timed out after {waited_ms} ms waiting for lock on {resource}")]
    LockTimeout { resource: String, waited_ms: u64 },

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

pub trait IntoDbErr {
    fn into_db_err(self) -> DbErr;
}

impl IntoDbErr for DbErr {
    fn into_db_err(self) -> DbErr {
        self
    }
}

impl IntoDbErr for String {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self)
    }
}

impl IntoDbErr for &str {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self.to_string())
    }
}

impl ServiceError {
    /// Generic constructor that normalizes any supported database error input.
    pub fn db_error<E: IntoDbErr>(error: E) -> Self {
        ServiceError::DatabaseError(error.into_db_err())
    }

    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InsufficientStock { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::LockTimeout { .. } => StatusCode::CONFLICT,
            Self::ValidationError(_) => StatusCode::BAD_REQUEST,
            Self::DatabaseError(_) | Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error code for API and CLI payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "stock_not_found",
            Self::InsufficientStock { .. } => "insufficient_stock",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::ValidationError(_) => "validation_error",
            Self::DatabaseError(_) => "database_error",
            Self::InternalError(_) => "internal_error",
        }
    }

    /// Returns the error message suitable for end users.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::NotFound(_) => "Stock not found for this lot and warehouse".to_string(),
            Self::InsufficientStock { available, .. } => {
                format!("Insufficient stock, {} available", available)
            }
            Self::LockTimeout { .. } => {
                "Stock record is busy, please retry the operation".to_string()
            }
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::InternalError(_) => "Internal server error".to_string(),
            Self::ValidationError(_) => self.to_string(),
        }
    }

    /// True when the same request may succeed if retried unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}
