mod calendar;
mod envelope;
mod error;
mod extractors;
mod quickbooks;
mod webhooks;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderName, HeaderValue, Method};
use axum::{routing::get, Json, Router};
use chrono::Utc;
use opsdesk_common::types::ServiceInfo;
use opsdesk_config::{init_tracing, AppConfig, WebhookConfig};
use opsdesk_db::calendar::pg_repository::PgCalendarRepository;
use opsdesk_db::calendar::repositories::CalendarRepository;
use opsdesk_db::entities::pg_repository::PgEntityRepository;
use opsdesk_db::entities::repositories::EntityRepository;
use opsdesk_db::sync::pg_repository::PgSyncStateRepository;
use opsdesk_db::sync::repositories::SyncStateRepository;
use opsdesk_db::tokens::pg_repository::PgTokenRepository;
use opsdesk_db::tokens::repositories::TokenRepository;
use opsdesk_db::webhooks::pg_repository::PgWebhookEventRepository;
use opsdesk_quickbooks::oauth::{OAuthClient, PendingAuthorizations};
use opsdesk_quickbooks::queue::{spawn_periodic_sync, spawn_sync_worker};
use opsdesk_quickbooks::sync::release_stale_locks;
use opsdesk_quickbooks::webhook::WebhookProcessor;
use opsdesk_quickbooks::{QboClient, QboConfig, SyncCoordinator, SyncQueue, TokenManager};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

#[derive(Clone)]
pub struct AppState {
    pub tokens: Arc<dyn TokenRepository>,
    pub sync_states: Arc<dyn SyncStateRepository>,
    pub entities: Arc<dyn EntityRepository>,
    pub calendar: Arc<dyn CalendarRepository>,
    pub webhooks: WebhookProcessor,
    pub webhook_config: WebhookConfig,
    pub queue: SyncQueue,
    /// Present only when QuickBooks credentials are configured.
    pub quickbooks: Option<QuickBooksState>,
}

#[derive(Clone)]
pub struct QuickBooksState {
    pub oauth: OAuthClient,
    pub client: QboClient,
    pub tokens: Arc<TokenManager>,
    pub pending: Arc<PendingAuthorizations>,
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn info() -> Json<ServiceInfo> {
    Json(ServiceInfo::new("opsdesk-api"))
}

fn build_router(state: AppState, cors_origins: &[String]) -> Router {
    let origins: Vec<HeaderValue> = cors_origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-realm-id"),
        ]);

    Router::new()
        .route("/health", get(health))
        .route("/info", get(info))
        .merge(quickbooks::router())
        .merge(webhooks::router())
        .merge(calendar::router())
        .layer(cors)
        .with_state(state)
}

async fn shutdown_signal(cancel: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        return;
    }
    tracing::info!("shutdown requested");
    cancel.cancel();
}

#[tokio::main]
async fn main() {
    let config = AppConfig::from_env().expect("failed to load config");
    init_tracing(&config.log_level);
    tracing::info!(service = "opsdesk-api", "starting");

    let qbo_config = QboConfig::from_env().expect("invalid QuickBooks configuration");

    let pool = opsdesk_db::create_pool(&config.database_url)
        .await
        .expect("failed to create database pool");
    opsdesk_db::run_migrations(&pool)
        .await
        .expect("failed to run migrations");

    let tokens: Arc<dyn TokenRepository> = Arc::new(PgTokenRepository::new(pool.clone()));
    let sync_states: Arc<dyn SyncStateRepository> =
        Arc::new(PgSyncStateRepository::new(pool.clone()));
    let entities: Arc<dyn EntityRepository> = Arc::new(PgEntityRepository::new(pool.clone()));

    // Locks still heartbeated by a running ingest pass are left alone.
    if let Err(e) = release_stale_locks(sync_states.as_ref(), Utc::now()).await {
        tracing::error!(error = %e, "failed to release stale sync locks");
    }

    let cancel = CancellationToken::new();
    let (queue, receiver) = SyncQueue::new();
    let mut tasks = Vec::new();

    let quickbooks = match qbo_config {
        Some(cfg) => {
            let oauth = OAuthClient::new(&cfg).expect("failed to build OAuth client");
            let manager = Arc::new(TokenManager::new(
                tokens.clone(),
                Arc::new(oauth.clone()),
                cfg.refresh_threshold(),
            ));
            let client =
                QboClient::new(cfg.clone(), manager.clone()).expect("failed to build API client");
            let coordinator = Arc::new(SyncCoordinator::new(
                Arc::new(client.clone()),
                sync_states.clone(),
                entities.clone(),
            ));

            tasks.push(manager.clone().spawn_refresher(
                Duration::from_secs(cfg.refresh_interval_secs),
                cancel.clone(),
            ));
            tasks.push(spawn_sync_worker(coordinator, receiver, cancel.clone()));
            if let Some(secs) = cfg.sync_interval_secs {
                tasks.push(spawn_periodic_sync(
                    tokens.clone(),
                    queue.clone(),
                    Duration::from_secs(secs),
                    cancel.clone(),
                ));
            }

            tracing::info!(api_base_url = %cfg.api_base_url, "QuickBooks integration enabled");
            Some(QuickBooksState {
                oauth,
                client,
                tokens: manager,
                pending: Arc::new(PendingAuthorizations::new()),
            })
        }
        None => {
            tracing::warn!("QuickBooks not configured, OAuth and sync routes are disabled");
            drop(receiver);
            None
        }
    };

    let state = AppState {
        tokens,
        sync_states,
        entities,
        calendar: Arc::new(PgCalendarRepository::new(pool.clone())),
        webhooks: WebhookProcessor::new(
            Arc::new(PgWebhookEventRepository::new(pool)),
            queue.clone(),
        ),
        webhook_config: config.webhook.clone(),
        queue,
        quickbooks,
    };

    let app = build_router(state, &config.cors_origins);
    let addr: SocketAddr = config.bind_addr().parse().expect("invalid bind address");

    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await
        .expect("server error");

    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "background task panicked");
        }
    }
    tracing::info!("stopped");
}
