use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use opsdesk_db::tokens::models::QboToken;
use opsdesk_db::tokens::repositories::TokenRepository;

use crate::error::QboError;
use crate::oauth::{TokenEndpoint, TokenGrant};

/// Shortest period for background tickers.
pub(crate) const MIN_TICK: std::time::Duration = std::time::Duration::from_secs(1);

/// Owns the OAuth token lifecycle for every connected realm.
///
/// Refreshes are single-flight per realm: concurrent callers that find an
/// expiring token queue on the realm's lock, and whoever gets it second
/// re-reads the store and reuses the token the first caller just wrote.
pub struct TokenManager {
    repo: Arc<dyn TokenRepository>,
    endpoint: Arc<dyn TokenEndpoint>,
    threshold: Duration,
    refresh_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl TokenManager {
    pub fn new(
        repo: Arc<dyn TokenRepository>,
        endpoint: Arc<dyn TokenEndpoint>,
        threshold: Duration,
    ) -> Self {
        Self {
            repo,
            endpoint,
            threshold,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    fn realm_lock(&self, realm_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.refresh_locks.lock().unwrap_or_else(|p| p.into_inner());
        locks
            .entry(realm_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    async fn active(&self, realm_id: &str) -> Result<QboToken, QboError> {
        self.repo
            .get_active(realm_id)
            .await?
            .ok_or_else(|| QboError::NoActiveToken(realm_id.to_string()))
    }

    /// Current token for `realm_id`, refreshed first when it is close to expiry.
    ///
    /// A failed refresh still returns the stored token while it has not
    /// actually expired; once expired the failure is reported as
    /// [`QboError::TokenExpired`].
    pub async fn get_valid_token(&self, realm_id: &str) -> Result<QboToken, QboError> {
        let token = self.active(realm_id).await?;
        if !token.expires_within(Utc::now(), self.threshold) {
            return Ok(token);
        }

        let lock = self.realm_lock(realm_id);
        let _guard = lock.lock().await;

        let token = self.active(realm_id).await?;
        if !token.expires_within(Utc::now(), self.threshold) {
            return Ok(token);
        }

        match self.refresh_locked(&token).await {
            Ok(fresh) => Ok(fresh),
            Err(e) if !token.is_expired(Utc::now()) => {
                tracing::warn!(
                    realm_id,
                    expires_at = %token.expires_at,
                    error = %e,
                    "token refresh failed, using current token until expiry"
                );
                Ok(token)
            }
            Err(e) => Err(QboError::TokenExpired {
                realm_id: realm_id.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Refresh unconditionally, regardless of remaining lifetime.
    pub async fn refresh(&self, realm_id: &str) -> Result<QboToken, QboError> {
        let lock = self.realm_lock(realm_id);
        let _guard = lock.lock().await;

        let token = self.active(realm_id).await?;
        self.refresh_locked(&token).await
    }

    /// Refresh after the upstream API rejected `stale_access_token`.
    ///
    /// If another caller already rotated the token in the meantime the stored
    /// token is returned without a second refresh.
    pub async fn force_refresh(
        &self,
        realm_id: &str,
        stale_access_token: &str,
    ) -> Result<QboToken, QboError> {
        let lock = self.realm_lock(realm_id);
        let _guard = lock.lock().await;

        let token = self.active(realm_id).await?;
        if token.access_token != stale_access_token {
            return Ok(token);
        }
        self.refresh_locked(&token).await
    }

    /// Persist the tokens issued by a completed authorization-code exchange.
    pub async fn store_authorization(
        &self,
        realm_id: &str,
        grant: TokenGrant,
    ) -> Result<QboToken, QboError> {
        let lock = self.realm_lock(realm_id);
        let _guard = lock.lock().await;

        let stored = self
            .repo
            .rotate(grant.into_new_token(realm_id, Utc::now())?)
            .await?;
        tracing::info!(realm_id, expires_at = %stored.expires_at, "realm connected");
        Ok(stored)
    }

    /// Deactivate every token for the realm.
    pub async fn disconnect(&self, realm_id: &str) -> Result<u64, QboError> {
        let lock = self.realm_lock(realm_id);
        let _guard = lock.lock().await;

        let deactivated = self.repo.deactivate_all(realm_id).await?;
        tracing::info!(realm_id, deactivated, "realm disconnected");
        Ok(deactivated)
    }

    /// Caller must hold the realm lock.
    async fn refresh_locked(&self, token: &QboToken) -> Result<QboToken, QboError> {
        let realm_id = token.realm_id.as_str();
        let grant = self
            .endpoint
            .refresh(&token.refresh_token)
            .await
            .map_err(|e| {
                tracing::error!(realm_id, error = %e, "token refresh rejected");
                QboError::RefreshFailed {
                    realm_id: realm_id.to_string(),
                    reason: e.to_string(),
                }
            })?;

        let stored = self
            .repo
            .rotate(grant.into_new_token(realm_id, Utc::now())?)
            .await?;
        tracing::info!(realm_id, expires_at = %stored.expires_at, "access token refreshed");
        Ok(stored)
    }

    /// Refresh every active token that falls inside the threshold.
    /// Returns the number of realms refreshed; failures are logged.
    pub async fn refresh_expiring(&self) -> Result<usize, QboError> {
        let expiring = self.repo.list_expiring(Utc::now() + self.threshold).await?;
        let mut refreshed = 0;

        for token in expiring {
            let realm_id = token.realm_id.as_str();
            let lock = self.realm_lock(realm_id);
            let _guard = lock.lock().await;

            let current = match self.active(realm_id).await {
                Ok(t) => t,
                Err(e) => {
                    tracing::debug!(realm_id, error = %e, "token vanished before refresh");
                    continue;
                }
            };
            if !current.expires_within(Utc::now(), self.threshold) {
                continue;
            }

            match self.refresh_locked(&current).await {
                Ok(_) => refreshed += 1,
                Err(e) => tracing::warn!(realm_id, error = %e, "background refresh failed"),
            }
        }

        Ok(refreshed)
    }

    /// Run [`Self::refresh_expiring`] every `interval` until `cancel` fires.
    pub fn spawn_refresher(
        self: Arc<Self>,
        interval: std::time::Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            // `interval` panics on a zero period.
            let interval = interval.max(MIN_TICK);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(interval_secs = interval.as_secs(), "token refresher started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match self.refresh_expiring().await {
                            Ok(0) => {}
                            Ok(count) => tracing::info!(count, "refreshed expiring tokens"),
                            Err(e) => tracing::error!(error = %e, "token refresh sweep failed"),
                        }
                    }
                }
            }

            tracing::info!("token refresher stopped");
        })
    }
}
