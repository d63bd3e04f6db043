// =============================================================================
// Error Taxonomy — typed error kinds mapped to HTTP responses
// =============================================================================
//
// Every fallible core operation returns `Result<T, CoreError>`. Handlers never
// build status codes by hand; the `IntoResponse` impl below is the single
// place where an error kind becomes a wire response.
//
// Internal errors are logged with full detail but the response body stays
// generic — database messages and panic text never leave the process.
// =============================================================================

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Unified error type for the ledger, market-data, ingestion, realtime, and
/// indicator components.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed input: bad symbol pattern, non-positive quantity, unknown
    /// event type, out-of-range indicator parameters, unparsable date.
    #[error("{0}")]
    Validation(String),

    /// Missing portfolio, symbol, or position.
    #[error("{0}")]
    NotFound(String),

    /// Duplicate bulk-sync start, or a write that collides with existing
    /// state outside the idempotent upsert path.
    #[error("{0}")]
    Conflict(String),

    /// Timeout, 5xx, or parse failure from an external feed. Recoverable:
    /// ingestion counts the day as failed, the broadcaster retries next
    /// cycle. Never terminates the service.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Indicator math starved of points.
    #[error("{0}")]
    InsufficientData(String),

    /// Database or programming fault. Details are logged, not returned.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    pub fn insufficient_data(msg: impl Into<String>) -> Self {
        Self::InsufficientData(msg.into())
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::InsufficientData(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Internal(anyhow::Error::new(e).context("database operation failed"))
    }
}

/// JSON failure envelope: `{"success": false, "error": "<message>"}`.
#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

impl IntoResponse for CoreError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();

        let message = match &self {
            Self::Internal(inner) => {
                error!(error = ?inner, "internal error");
                "internal error".to_string()
            }
            other => other.to_string(),
        };

        let body = ErrorBody {
            success: false,
            error: message,
        };

        (status, Json(body)).into_response()
    }
}
