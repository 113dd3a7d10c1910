use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use opsdesk_common::error::OpsError;
use opsdesk_quickbooks::webhook::{
    verify_intuit_signature, verify_shared_secret, ChangeNotification, IntuitPayload,
    RowChangePayload, WebhookOutcome, INTUIT_SIGNATURE_HEADER, SHARED_SECRET_HEADER,
};
use serde::{Deserialize, Serialize};

use crate::envelope::ApiResponse;
use crate::error::ApiError;
use crate::extractors::{parse_realm, ApiPath, ApiQuery, REALM_HEADER};
use crate::AppState;

pub const PROVIDER_QUICKBOOKS: &str = "quickbooks";
pub const PROVIDER_SUPABASE: &str = "supabase";

#[derive(Debug, Default, Deserialize)]
pub struct WebhookQuery {
    pub realm_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub provider: String,
    pub received: usize,
    pub duplicates: usize,
    pub enqueued: usize,
}

impl WebhookAck {
    fn new(provider: &str, outcome: WebhookOutcome) -> Self {
        Self {
            provider: provider.to_string(),
            received: outcome.received,
            duplicates: outcome.duplicates,
            enqueued: outcome.enqueued,
        }
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Apply the configured strictness to a verification result.
fn enforce(strict: bool, provider: &str, verified: Result<(), &'static str>) -> Result<(), ApiError> {
    match verified {
        Ok(()) => Ok(()),
        Err(reason) if strict => {
            tracing::warn!(provider, reason, "rejecting unverified webhook");
            Err(ApiError(OpsError::Unauthorized(format!(
                "webhook verification failed: {reason}"
            ))))
        }
        Err(reason) => {
            tracing::warn!(provider, reason, "accepting unverified webhook (lenient mode)");
            Ok(())
        }
    }
}

/// Receive a change notification and queue the matching syncs.
/// No sync runs inside the request.
pub async fn receive(
    State(state): State<AppState>,
    ApiPath(provider): ApiPath<String>,
    ApiQuery(query): ApiQuery<WebhookQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<ApiResponse<WebhookAck>, ApiError> {
    let strict = state.webhook_config.strict;

    let notifications: Vec<ChangeNotification> = match provider.as_str() {
        PROVIDER_QUICKBOOKS => {
            let verified = match (
                state.webhook_config.qbo_verifier_token.as_deref(),
                header(&headers, INTUIT_SIGNATURE_HEADER),
            ) {
                (None, _) => Err("no verifier token configured"),
                (Some(_), None) => Err("missing intuit-signature header"),
                (Some(token), Some(sig)) if verify_intuit_signature(token, &body, sig) => Ok(()),
                (Some(_), Some(_)) => Err("signature mismatch"),
            };
            enforce(strict, &provider, verified)?;

            let payload: IntuitPayload = serde_json::from_slice(&body).map_err(|e| {
                ApiError(OpsError::Validation(format!("invalid webhook payload: {e}")))
            })?;
            payload.notifications()
        }
        PROVIDER_SUPABASE => {
            let verified = match (
                state.webhook_config.shared_secret.as_deref(),
                header(&headers, SHARED_SECRET_HEADER),
            ) {
                (None, _) => Err("no shared secret configured"),
                (Some(_), None) => Err("missing x-webhook-secret header"),
                (Some(expected), Some(provided)) if verify_shared_secret(expected, provided) => {
                    Ok(())
                }
                (Some(_), Some(_)) => Err("secret mismatch"),
            };
            enforce(strict, &provider, verified)?;

            let realm_raw = query
                .realm_id
                .as_deref()
                .or_else(|| header(&headers, REALM_HEADER))
                .ok_or_else(|| {
                    ApiError(OpsError::Validation(
                        "realm_id query parameter or X-Realm-Id header required".to_string(),
                    ))
                })?;
            let realm_id = parse_realm(realm_raw.trim())?;

            let payload: RowChangePayload = serde_json::from_slice(&body).map_err(|e| {
                ApiError(OpsError::Validation(format!("invalid webhook payload: {e}")))
            })?;
            match payload.notification(&realm_id) {
                Some(n) => vec![n],
                None => {
                    tracing::info!(table = %payload.table, "ignoring change on unmirrored table");
                    Vec::new()
                }
            }
        }
        other => {
            return Err(ApiError(OpsError::NotFound(format!(
                "unknown webhook provider: {other}"
            ))))
        }
    };

    let outcome = state.webhooks.process(&provider, notifications).await;
    Ok(ApiResponse::ok(WebhookAck::new(&provider, outcome)))
}
