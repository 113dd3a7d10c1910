pub mod handlers;
pub mod requests;
pub mod responses;

use axum::routing::{get, post};
use axum::Router;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/quickbooks/authorize", get(handlers::authorize))
        .route("/api/quickbooks/callback", get(handlers::callback))
        .route(
            "/api/quickbooks/connection",
            get(handlers::connection_status).delete(handlers::disconnect),
        )
        .route("/api/quickbooks/refresh", post(handlers::refresh_token))
        .route("/api/quickbooks/sync", post(handlers::trigger_sync))
        .route("/api/quickbooks/sync-state", get(handlers::sync_state))
        .route(
            "/api/quickbooks/entities/{entity_type}",
            get(handlers::list_entities),
        )
}
