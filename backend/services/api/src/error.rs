use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use opsdesk_common::error::OpsError;
use opsdesk_quickbooks::QboError;

pub struct ApiError(pub OpsError);

impl From<OpsError> for ApiError {
    fn from(err: OpsError) -> Self {
        Self(err)
    }
}

impl From<QboError> for ApiError {
    fn from(err: QboError) -> Self {
        Self(err.into())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            OpsError::Validation(_) => StatusCode::BAD_REQUEST,
            OpsError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            OpsError::Forbidden(_) => StatusCode::FORBIDDEN,
            OpsError::NotFound(_) => StatusCode::NOT_FOUND,
            OpsError::Conflict(_) => StatusCode::CONFLICT,
            OpsError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            OpsError::Config(_) | OpsError::Database(_) | OpsError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }

        let message = match &self.0 {
            OpsError::NotFound(msg)
            | OpsError::Validation(msg)
            | OpsError::Conflict(msg)
            | OpsError::Unauthorized(msg)
            | OpsError::Forbidden(msg) => msg.clone(),
            other => other.to_string(),
        };

        let body = serde_json::json!({
            "success": false,
            "error": self.0.code(),
            "message": message,
        });
        (status, Json(body)).into_response()
    }
}
