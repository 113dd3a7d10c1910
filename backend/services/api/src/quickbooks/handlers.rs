use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use opsdesk_common::error::OpsError;
use opsdesk_db::entities::models::{EntityFilter, EntityType, MirroredEntity};
use opsdesk_db::entities::repositories::EntityRepository;
use opsdesk_db::sync::models::SyncState;
use opsdesk_db::sync::repositories::SyncStateRepository;
use opsdesk_db::tokens::repositories::TokenRepository;
use opsdesk_quickbooks::{QboError, SyncJob};

use crate::envelope::{page_bounds, ApiResponse};
use crate::error::ApiError;
use crate::extractors::{parse_realm, ApiPath, ApiQuery, RealmId};
use crate::quickbooks::requests::{CallbackQuery, ConnectionQuery, EntityListQuery, SyncRequest};
use crate::quickbooks::responses::{AuthorizeResponse, ConnectionResponse, SyncQueuedResponse};
use crate::{AppState, QuickBooksState};

fn integration(state: &AppState) -> Result<&QuickBooksState, ApiError> {
    state.quickbooks.as_ref().ok_or_else(|| {
        ApiError(OpsError::NotFound(
            "QuickBooks integration is not configured".to_string(),
        ))
    })
}

fn parse_entity_type(raw: &str) -> Result<EntityType, ApiError> {
    raw.parse::<EntityType>()
        .map_err(|e| ApiError(OpsError::Validation(e)))
}

// ── OAuth ───────────────────────────────────────────────────────

pub async fn authorize(
    State(state): State<AppState>,
) -> Result<ApiResponse<AuthorizeResponse>, ApiError> {
    let qbo = integration(&state)?;
    let csrf_state = qbo.pending.issue();
    let url = qbo.oauth.authorize_url(&csrf_state)?;

    Ok(ApiResponse::ok(AuthorizeResponse {
        authorization_url: url.to_string(),
        state: csrf_state,
    }))
}

pub async fn callback(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<CallbackQuery>,
) -> Result<ApiResponse<ConnectionResponse>, ApiError> {
    let qbo = integration(&state)?;

    if let Some(error) = query.error {
        let detail = query.error_description.unwrap_or_default();
        tracing::warn!(%error, %detail, "authorization denied");
        return Err(ApiError(OpsError::Unauthorized(format!(
            "authorization denied: {error} {detail}"
        ))));
    }

    let csrf_state = query.state.unwrap_or_default();
    if !qbo.pending.consume(&csrf_state) {
        return Err(ApiError(OpsError::Forbidden(
            "unknown or expired authorization state".to_string(),
        )));
    }

    let code = query
        .code
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ApiError(OpsError::Validation("missing code".to_string())))?;
    let realm_id = parse_realm(query.realm_id.as_deref().unwrap_or_default())?;

    let grant = qbo.oauth.exchange_code(&code).await?;
    let token = qbo.tokens.store_authorization(&realm_id, grant).await?;

    // Seed the mirror right away.
    state.queue.enqueue(SyncJob::all(realm_id.clone()));

    Ok(ApiResponse::ok(ConnectionResponse {
        realm_id,
        connected: true,
        expires_at: Some(token.expires_at),
        refresh_token_expires_at: token.refresh_token_expires_at,
        last_updated: Some(token.last_updated),
        company_name: None,
    })
    .with_message("QuickBooks connected"))
}

// ── Connection ──────────────────────────────────────────────────

pub async fn connection_status(
    State(state): State<AppState>,
    RealmId(realm_id): RealmId,
    ApiQuery(query): ApiQuery<ConnectionQuery>,
) -> Result<ApiResponse<ConnectionResponse>, ApiError> {
    let company_name = if query.verify {
        let qbo = integration(&state)?;
        let info = qbo.client.company_info(&realm_id).await?;
        tracing::info!(realm_id = %realm_id, "connection verified");
        Some(
            info.get("CompanyName")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        )
    } else {
        None
    };

    let token = state.tokens.get_active(&realm_id).await?;

    Ok(ApiResponse::ok(ConnectionResponse {
        connected: token.is_some(),
        expires_at: token.as_ref().map(|t| t.expires_at),
        refresh_token_expires_at: token.as_ref().and_then(|t| t.refresh_token_expires_at),
        last_updated: token.as_ref().map(|t| t.last_updated),
        realm_id,
        company_name,
    }))
}

pub async fn disconnect(
    State(state): State<AppState>,
    RealmId(realm_id): RealmId,
) -> Result<ApiResponse<()>, ApiError> {
    let qbo = integration(&state)?;
    let deactivated = qbo.tokens.disconnect(&realm_id).await?;
    if deactivated == 0 {
        return Err(ApiError(OpsError::NotFound(format!(
            "realm not connected: {realm_id}"
        ))));
    }
    Ok(ApiResponse::message("QuickBooks disconnected"))
}

pub async fn refresh_token(
    State(state): State<AppState>,
    RealmId(realm_id): RealmId,
) -> Result<ApiResponse<ConnectionResponse>, ApiError> {
    let qbo = integration(&state)?;
    let token = qbo.tokens.refresh(&realm_id).await?;

    Ok(ApiResponse::ok(ConnectionResponse {
        realm_id,
        connected: true,
        expires_at: Some(token.expires_at),
        refresh_token_expires_at: token.refresh_token_expires_at,
        last_updated: Some(token.last_updated),
        company_name: None,
    }))
}

// ── Sync ────────────────────────────────────────────────────────

/// Queue a sync and return immediately. An empty body syncs every type.
pub async fn trigger_sync(
    State(state): State<AppState>,
    RealmId(realm_id): RealmId,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    integration(&state)?;

    let request: SyncRequest = if body.is_empty() {
        SyncRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError(OpsError::Validation(format!("invalid body: {e}"))))?
    };
    let entity_type = request
        .entity_type
        .as_deref()
        .map(parse_entity_type)
        .transpose()?;

    if state.tokens.get_active(&realm_id).await?.is_none() {
        return Err(QboError::NoActiveToken(realm_id).into());
    }

    let job = SyncJob {
        realm_id: realm_id.clone(),
        entity_type,
    };
    let queued = state.queue.enqueue(job);
    tracing::info!(%realm_id, entity_type = ?entity_type, queued, "sync requested");

    Ok((
        StatusCode::ACCEPTED,
        ApiResponse::ok(SyncQueuedResponse {
            realm_id,
            entity_type: entity_type.map(|e| e.as_str().to_string()),
            queued,
        }),
    ))
}

pub async fn sync_state(
    State(state): State<AppState>,
    RealmId(realm_id): RealmId,
) -> Result<ApiResponse<Vec<SyncState>>, ApiError> {
    let states = state.sync_states.list_for_realm(&realm_id).await?;
    Ok(ApiResponse::ok(states))
}

// ── Mirrored entities ───────────────────────────────────────────

pub async fn list_entities(
    State(state): State<AppState>,
    RealmId(realm_id): RealmId,
    ApiPath(entity_type): ApiPath<String>,
    ApiQuery(query): ApiQuery<EntityListQuery>,
) -> Result<ApiResponse<Vec<MirroredEntity>>, ApiError> {
    let entity_type = parse_entity_type(&entity_type)?;
    let (limit, offset) = page_bounds(query.limit, query.offset);

    let filter = EntityFilter {
        search: query.search.filter(|s| !s.trim().is_empty()),
        limit: Some(limit),
        offset: Some(offset),
    };
    let (rows, total) = state.entities.list(&realm_id, entity_type, filter).await?;
    Ok(ApiResponse::page(rows, total, limit, offset))
}
