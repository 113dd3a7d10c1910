use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{FromRequest, FromRequestParts, Path, Query, Request};
use axum::http::request::Parts;
use axum::Json;
use opsdesk_common::error::OpsError;
use serde::de::DeserializeOwned;

use crate::error::ApiError;

pub const REALM_HEADER: &str = "X-Realm-Id";

/// QuickBooks company (realm) the request acts on, from `X-Realm-Id`.
pub struct RealmId(pub String);

impl<S: Send + Sync> FromRequestParts<S> for RealmId {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(REALM_HEADER)
            .ok_or_else(|| validation(format!("missing {REALM_HEADER} header")))?;

        let value = header
            .to_str()
            .map_err(|_| validation(format!("invalid {REALM_HEADER} header value")))?
            .trim();

        parse_realm(value).map(RealmId)
    }
}

pub fn parse_realm(value: &str) -> Result<String, ApiError> {
    if value.is_empty() || value.len() > 64 || !value.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(validation(format!("invalid realm id: {value:?}")));
    }
    Ok(value.to_string())
}

fn validation(msg: String) -> ApiError {
    ApiError(OpsError::Validation(msg))
}

// Wrappers that turn axum's plain-text rejections into the JSON error envelope.

pub struct ApiJson<T>(pub T);

impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(validation(JsonRejection::body_text(&rejection))),
        }
    }
}

pub struct ApiQuery<T>(pub T);

impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Query::<T>::from_request_parts(parts, state).await {
            Ok(Query(value)) => Ok(Self(value)),
            Err(rejection) => Err(validation(QueryRejection::body_text(&rejection))),
        }
    }
}

pub struct ApiPath<T>(pub T);

impl<T, S> FromRequestParts<S> for ApiPath<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Path::<T>::from_request_parts(parts, state).await {
            Ok(Path(value)) => Ok(Self(value)),
            Err(rejection) => Err(validation(PathRejection::body_text(&rejection))),
        }
    }
}
