use std::sync::Arc;

use chrono::Utc;
use opsdesk_config::init_tracing;
use opsdesk_db::entities::pg_repository::PgEntityRepository;
use opsdesk_db::sync::pg_repository::PgSyncStateRepository;
use opsdesk_db::tokens::pg_repository::PgTokenRepository;
use opsdesk_db::tokens::repositories::TokenRepository;
use opsdesk_quickbooks::oauth::OAuthClient;
use opsdesk_quickbooks::sync::release_stale_locks;
use opsdesk_quickbooks::{QboClient, QboConfig, SyncCoordinator, TokenManager};
use tokio_util::sync::CancellationToken;

/// One-shot sync of every connected realm, for cron-style scheduling.
#[tokio::main]
async fn main() {
    init_tracing("info");
    let _ = dotenvy::dotenv();

    tracing::info!(service = "opsdesk-ingest", "starting");

    let qbo_config = match QboConfig::from_env() {
        Ok(Some(cfg)) => cfg,
        Ok(None) => {
            tracing::info!("no QuickBooks credentials found, nothing to sync");
            return;
        }
        Err(e) => panic!("QuickBooks configuration error (fail-fast): {e}"),
    };

    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = opsdesk_db::create_pool(&database_url)
        .await
        .expect("failed to connect to database");
    opsdesk_db::run_migrations(&pool)
        .await
        .expect("failed to run migrations");

    let tokens: Arc<dyn TokenRepository> = Arc::new(PgTokenRepository::new(pool.clone()));
    let oauth = OAuthClient::new(&qbo_config).expect("failed to create OAuth client");
    let manager = Arc::new(TokenManager::new(
        tokens.clone(),
        Arc::new(oauth),
        qbo_config.refresh_threshold(),
    ));
    let client = QboClient::new(qbo_config, manager).expect("failed to create QuickBooks client");
    let sync_states = Arc::new(PgSyncStateRepository::new(pool.clone()));
    if let Err(e) = release_stale_locks(sync_states.as_ref(), Utc::now()).await {
        tracing::error!(error = %e, "failed to release stale sync locks");
    }
    let coordinator = SyncCoordinator::new(
        Arc::new(client),
        sync_states,
        Arc::new(PgEntityRepository::new(pool)),
    );

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling in-flight sync");
            ctrl_c.cancel();
        }
    });

    let realms = tokens
        .list_active_realms()
        .await
        .expect("failed to list connected realms");
    tracing::info!(count = realms.len(), "syncing connected realms");

    let mut failures = 0;
    for realm_id in &realms {
        let report = coordinator.sync_all(realm_id, &cancel).await;
        for (entity_type, error) in &report.failed {
            tracing::error!(%realm_id, %entity_type, %error, "entity sync failed");
        }
        failures += report.failed.len();
    }

    tracing::info!(realms = realms.len(), failures, "ingest finished");
    if failures > 0 {
        std::process::exit(1);
    }
}
