use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use opsdesk_db::tokens::models::NewToken;

use crate::config::{QboConfig, ACCOUNTING_SCOPE};
use crate::error::QboError;

/// How long an issued authorization `state` stays redeemable.
pub const STATE_TTL: Duration = Duration::from_secs(600);

/// Token material returned by the Intuit token endpoint.
#[derive(Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    #[serde(default)]
    pub x_refresh_token_expires_in: Option<i64>,
}

impl TokenGrant {
    /// Resolve the relative lifetimes against `issued_at`.
    pub fn into_new_token(
        self,
        realm_id: &str,
        issued_at: DateTime<Utc>,
    ) -> Result<NewToken, QboError> {
        let expires_at = expiry(issued_at, "expires_in", self.expires_in)?;
        let refresh_token_expires_at = self
            .x_refresh_token_expires_in
            .map(|secs| expiry(issued_at, "x_refresh_token_expires_in", secs))
            .transpose()?;

        Ok(NewToken {
            realm_id: realm_id.to_string(),
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            refresh_token_expires_at,
        })
    }
}

fn expiry(issued_at: DateTime<Utc>, field: &str, secs: i64) -> Result<DateTime<Utc>, QboError> {
    TimeDelta::try_seconds(secs)
        .and_then(|lifetime| issued_at.checked_add_signed(lifetime))
        .ok_or_else(|| QboError::Decode(format!("{field} out of range: {secs}")))
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("expires_in", &self.expires_in)
            .field("x_refresh_token_expires_in", &self.x_refresh_token_expires_in)
            .finish_non_exhaustive()
    }
}

/// Exchanges a refresh token for new token material.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, QboError>;
}

#[derive(Clone)]
pub struct OAuthClient {
    http: Client,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    auth_url: String,
    token_url: String,
}

impl OAuthClient {
    pub fn new(config: &QboConfig) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri.clone(),
            auth_url: config.auth_url.clone(),
            token_url: config.token_url.clone(),
        })
    }

    /// For testing: point token requests at a specific URL (e.g., wiremock).
    #[cfg(test)]
    pub fn with_token_url(mut self, token_url: &str) -> Self {
        self.token_url = token_url.to_string();
        self
    }

    /// Consent URL the user is redirected to.
    pub fn authorize_url(&self, state: &str) -> Result<Url, QboError> {
        Url::parse_with_params(
            &self.auth_url,
            &[
                ("client_id", self.client_id.as_str()),
                ("response_type", "code"),
                ("scope", ACCOUNTING_SCOPE),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("state", state),
            ],
        )
        .map_err(|e| QboError::Decode(format!("invalid authorization URL: {e}")))
    }

    /// Trade an authorization code from the consent redirect for tokens.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenGrant, QboError> {
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
        ])
        .await
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenGrant, QboError> {
        let response = self
            .http
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .header(reqwest::header::ACCEPT, "application/json")
            .form(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(QboError::Upstream { status, body });
        }

        response
            .json::<TokenGrant>()
            .await
            .map_err(|e| QboError::Decode(format!("token response: {e}")))
    }
}

#[async_trait]
impl TokenEndpoint for OAuthClient {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, QboError> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }
}

/// Outstanding authorization `state` values awaiting their callback.
#[derive(Default)]
pub struct PendingAuthorizations {
    issued: Mutex<HashMap<String, Instant>>,
}

impl PendingAuthorizations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate and remember a fresh CSRF state token.
    pub fn issue(&self) -> String {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill(&mut bytes);
        let state: String = bytes.iter().map(|b| format!("{b:02x}")).collect();

        let now = Instant::now();
        let mut issued = self.issued.lock().unwrap_or_else(|p| p.into_inner());
        issued.retain(|_, at| now.duration_since(*at) < STATE_TTL);
        issued.insert(state.clone(), now);
        state
    }

    /// Redeem a state token. Each token is accepted at most once and only before it expires.
    pub fn consume(&self, state: &str) -> bool {
        let mut issued = self.issued.lock().unwrap_or_else(|p| p.into_inner());
        match issued.remove(state) {
            Some(at) => at.elapsed() < STATE_TTL,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> QboConfig {
        QboConfig {
            client_id: "client-id".to_string(),
            client_secret: "client-secret".to_string(),
            redirect_uri: "http://localhost:8080/api/quickbooks/callback".to_string(),
            api_base_url: "http://localhost".to_string(),
            auth_url: crate::config::DEFAULT_AUTH_URL.to_string(),
            token_url: "http://localhost/token".to_string(),
            minor_version: 75,
            page_size: 100,
            timeout_secs: 5,
            refresh_threshold_secs: 600,
            refresh_interval_secs: 300,
            sync_interval_secs: None,
        }
    }

    fn grant_body() -> serde_json::Value {
        serde_json::json!({
            "token_type": "bearer",
            "access_token": "new-access",
            "refresh_token": "new-refresh",
            "expires_in": 3600,
            "x_refresh_token_expires_in": 8726400
        })
    }

    #[test]
    fn authorize_url_carries_scope_and_state() {
        let client = OAuthClient::new(&test_config()).unwrap();
        let url = client.authorize_url("abc123").unwrap();
        let params: HashMap<_, _> = url.query_pairs().into_owned().collect();

        assert_eq!(params["client_id"], "client-id");
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["scope"], ACCOUNTING_SCOPE);
        assert_eq!(params["state"], "abc123");
        assert!(url.as_str().starts_with(crate::config::DEFAULT_AUTH_URL));
    }

    #[tokio::test]
    async fn refresh_posts_form_with_basic_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(header_exists("authorization"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=old-refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(grant_body()))
            .expect(1)
            .mount(&server)
            .await;

        let client = OAuthClient::new(&test_config())
            .unwrap()
            .with_token_url(&format!("{}/token", server.uri()));

        let grant = client.refresh("old-refresh").await.unwrap();
        assert_eq!(grant.access_token, "new-access");
        assert_eq!(grant.refresh_token, "new-refresh");
        assert_eq!(grant.expires_in, 3600);
    }

    #[tokio::test]
    async fn refresh_rejection_surfaces_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(400).set_body_string(r#"{"error":"invalid_grant"}"#),
            )
            .mount(&server)
            .await;

        let client = OAuthClient::new(&test_config())
            .unwrap()
            .with_token_url(&format!("{}/token", server.uri()));

        match client.refresh("revoked").await {
            Err(QboError::Upstream { status, body }) => {
                assert_eq!(status.as_u16(), 400);
                assert!(body.contains("invalid_grant"));
            }
            other => panic!("expected Upstream, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn exchange_code_sends_redirect_uri() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=auth-code"))
            .and(body_string_contains("redirect_uri="))
            .respond_with(ResponseTemplate::new(200).set_body_json(grant_body()))
            .mount(&server)
            .await;

        let client = OAuthClient::new(&test_config())
            .unwrap()
            .with_token_url(&format!("{}/token", server.uri()));

        let grant = client.exchange_code("auth-code").await.unwrap();
        let issued_at = Utc::now();
        let token = grant.into_new_token("4620816365", issued_at).unwrap();
        assert_eq!(token.realm_id, "4620816365");
        assert_eq!(token.expires_at, issued_at + chrono::Duration::seconds(3600));
        assert!(token.refresh_token_expires_at.is_some());
    }

    #[test]
    fn out_of_range_lifetime_is_decode_error() {
        let grant: TokenGrant = serde_json::from_value(serde_json::json!({
            "access_token": "a",
            "refresh_token": "r",
            "expires_in": i64::MAX,
        }))
        .unwrap();
        assert!(matches!(
            grant.into_new_token("4620816365", Utc::now()),
            Err(QboError::Decode(msg)) if msg.contains("expires_in")
        ));

        let grant: TokenGrant = serde_json::from_value(serde_json::json!({
            "access_token": "a",
            "refresh_token": "r",
            "expires_in": 3600,
            "x_refresh_token_expires_in": i64::MIN,
        }))
        .unwrap();
        assert!(matches!(
            grant.into_new_token("4620816365", Utc::now()),
            Err(QboError::Decode(msg)) if msg.contains("x_refresh_token_expires_in")
        ));
    }

    #[test]
    fn state_is_single_use() {
        let pending = PendingAuthorizations::new();
        let state = pending.issue();
        assert_eq!(state.len(), 32);
        assert!(pending.consume(&state));
        assert!(!pending.consume(&state));
        assert!(!pending.consume("never-issued"));
    }
}
