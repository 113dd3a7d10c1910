use opsdesk_common::error::OpsError;
use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum QboError {
    #[error("no active QuickBooks token for realm {0}")]
    NoActiveToken(String),

    #[error("token for realm {realm_id} expired and could not be refreshed: {reason}")]
    TokenExpired { realm_id: String, reason: String },

    #[error("token refresh failed for realm {realm_id}: {reason}")]
    RefreshFailed { realm_id: String, reason: String },

    #[error("HTTP {status}: {body}")]
    Upstream { status: StatusCode, body: String },

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error(transparent)]
    Store(#[from] OpsError),

    #[error("sync pass cancelled")]
    Cancelled,
}

impl From<QboError> for OpsError {
    fn from(err: QboError) -> Self {
        match err {
            QboError::NoActiveToken(_)
            | QboError::TokenExpired { .. }
            | QboError::RefreshFailed { .. } => OpsError::Unauthorized(err.to_string()),
            QboError::Upstream { status, body } => OpsError::Upstream {
                status: status.as_u16(),
                body,
            },
            QboError::Store(inner) => inner,
            QboError::Request(_) | QboError::Decode(_) => OpsError::Upstream {
                status: StatusCode::BAD_GATEWAY.as_u16(),
                body: err.to_string(),
            },
            QboError::Cancelled => OpsError::Internal(err.to_string()),
        }
    }
}
