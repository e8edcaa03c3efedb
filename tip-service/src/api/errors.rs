//! API error handling.
//!
//! Every failure renders as the `{"error": {"code", "description"}}`
//! envelope. Keeper rejections map onto 400, exhausted penalty buckets
//! onto 429, and everything unexpected onto a 500 carrying an error id
//! that links the response to the server logs.

use axum::{Json, http::StatusCode, response::IntoResponse};
use serde_json::json;
use uuid::Uuid;

use crate::metrics::METRICS_KEY_SIGN_REJECTED;
use crate::services::keeper::KeeperError;
use tip_store::StoreError;

/// A structured error returned to clients.
#[derive(Debug)]
pub(crate) struct ApiError {
    pub(crate) code: StatusCode,
    pub(crate) description: String,
}

/// Result type used by the API handlers.
pub(crate) type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub(crate) fn bad_request(description: impl Into<String>) -> Self {
        Self {
            code: StatusCode::BAD_REQUEST,
            description: description.into(),
        }
    }

    pub(crate) fn too_many_requests() -> Self {
        Self {
            code: StatusCode::TOO_MANY_REQUESTS,
            description: "too many requests".into(),
        }
    }

    /// Logs the cause under a fresh error id and hides it from the
    /// client.
    pub(crate) fn internal(err: impl std::fmt::Debug) -> Self {
        let error_id = Uuid::new_v4();
        tracing::error!("{error_id} - {err:?}");
        Self {
            code: StatusCode::INTERNAL_SERVER_ERROR,
            description: format!("internal server error, id={error_id}"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = json!({
            "error": {
                "code": self.code.as_u16(),
                "description": self.description,
            }
        });
        (self.code, Json(body)).into_response()
    }
}

impl From<KeeperError> for ApiError {
    fn from(err: KeeperError) -> Self {
        tracing::debug!("keeper rejected request: {err}");
        metrics::counter!(METRICS_KEY_SIGN_REJECTED).increment(1);
        match err {
            KeeperError::TooManyRequests => Self::too_many_requests(),
            KeeperError::Store(inner) => Self::internal(inner),
            rejection => Self::bad_request(rejection.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidWatcher | StoreError::AssignorIsAssignee => {
                Self::bad_request(err.to_string())
            }
            inner => Self::internal(inner),
        }
    }
}
