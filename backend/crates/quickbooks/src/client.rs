use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;

use opsdesk_db::entities::models::EntityType;

use crate::config::QboConfig;
use crate::error::QboError;
use crate::models::query_rows;
use crate::tokens::TokenManager;

/// A paged source of upstream records, consumed by the sync coordinator.
#[async_trait]
pub trait EntitySource: Send + Sync {
    fn page_size(&self) -> u32;

    /// Records of `entity` updated at or after `since`, oldest first.
    /// `start_position` is 1-based; a page shorter than `page_size` is the last.
    async fn fetch_page(
        &self,
        realm_id: &str,
        entity: EntityType,
        since: Option<DateTime<Utc>>,
        start_position: u32,
    ) -> Result<Vec<Value>, QboError>;
}

#[derive(Clone)]
pub struct QboClient {
    http: Client,
    config: QboConfig,
    tokens: Arc<TokenManager>,
}

impl QboClient {
    pub fn new(config: QboConfig, tokens: Arc<TokenManager>) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            config,
            tokens,
        })
    }

    /// For testing: create a client pointing at a specific base URL (e.g., wiremock).
    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.config.api_base_url = base_url.to_string();
        self
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    fn company_url(&self, realm_id: &str, resource: &str) -> String {
        format!(
            "{}/v3/company/{}/{}",
            self.config.api_base_url, realm_id, resource
        )
    }

    /// Send an authorized request built by `build`.
    ///
    /// A 401 triggers one forced refresh and one replay. Any other non-2xx
    /// status is returned as [`QboError::Upstream`] without retrying.
    async fn send_authorized<F>(&self, realm_id: &str, build: F) -> Result<Response, QboError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let token = self.tokens.get_valid_token(realm_id).await?;
        let response = build(&self.http)
            .bearer_auth(&token.access_token)
            .send()
            .await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(response).await;
        }

        tracing::warn!(realm_id, "access token rejected upstream, forcing refresh");
        let fresh = self
            .tokens
            .force_refresh(realm_id, &token.access_token)
            .await?;
        let response = build(&self.http)
            .bearer_auth(&fresh.access_token)
            .send()
            .await?;
        check_status(response).await
    }

    async fn get_json(
        &self,
        realm_id: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<Value, QboError> {
        let response = self
            .send_authorized(realm_id, |http| {
                http.get(url)
                    .header(reqwest::header::ACCEPT, "application/json")
                    .query(query)
            })
            .await?;

        response
            .json::<Value>()
            .await
            .map_err(|e| QboError::Decode(e.to_string()))
    }

    /// Run a query-language statement against the realm.
    pub async fn query(&self, realm_id: &str, statement: &str) -> Result<Value, QboError> {
        let url = self.company_url(realm_id, "query");
        self.get_json(
            realm_id,
            &url,
            &[
                ("query", statement.to_string()),
                ("minorversion", self.config.minor_version.to_string()),
            ],
        )
        .await
    }

    async fn query_page(
        &self,
        realm_id: &str,
        entity: EntityType,
        since: Option<DateTime<Utc>>,
        start_position: u32,
    ) -> Result<Vec<Value>, QboError> {
        let statement = build_query(entity, since, start_position, self.config.page_size);
        tracing::debug!(realm_id, %entity, start_position, "querying page");
        let body = self.query(realm_id, &statement).await?;
        query_rows(entity, body)
    }

    pub async fn customers_page(
        &self,
        realm_id: &str,
        since: Option<DateTime<Utc>>,
        start_position: u32,
    ) -> Result<Vec<Value>, QboError> {
        self.query_page(realm_id, EntityType::Customer, since, start_position)
            .await
    }

    pub async fn invoices_page(
        &self,
        realm_id: &str,
        since: Option<DateTime<Utc>>,
        start_position: u32,
    ) -> Result<Vec<Value>, QboError> {
        self.query_page(realm_id, EntityType::Invoice, since, start_position)
            .await
    }

    pub async fn estimates_page(
        &self,
        realm_id: &str,
        since: Option<DateTime<Utc>>,
        start_position: u32,
    ) -> Result<Vec<Value>, QboError> {
        self.query_page(realm_id, EntityType::Estimate, since, start_position)
            .await
    }

    pub async fn items_page(
        &self,
        realm_id: &str,
        since: Option<DateTime<Utc>>,
        start_position: u32,
    ) -> Result<Vec<Value>, QboError> {
        self.query_page(realm_id, EntityType::Item, since, start_position)
            .await
    }

    /// The `CompanyInfo` record for the realm.
    pub async fn company_info(&self, realm_id: &str) -> Result<Value, QboError> {
        let url = self.company_url(realm_id, &format!("companyinfo/{realm_id}"));
        let mut body = self
            .get_json(
                realm_id,
                &url,
                &[("minorversion", self.config.minor_version.to_string())],
            )
            .await?;

        match body.get_mut("CompanyInfo").map(Value::take) {
            Some(info) => Ok(info),
            None => Err(QboError::Decode("missing CompanyInfo".to_string())),
        }
    }
}

#[async_trait]
impl EntitySource for QboClient {
    fn page_size(&self) -> u32 {
        self.config.page_size
    }

    async fn fetch_page(
        &self,
        realm_id: &str,
        entity: EntityType,
        since: Option<DateTime<Utc>>,
        start_position: u32,
    ) -> Result<Vec<Value>, QboError> {
        match entity {
            EntityType::Customer => self.customers_page(realm_id, since, start_position).await,
            EntityType::Invoice => self.invoices_page(realm_id, since, start_position).await,
            EntityType::Estimate => self.estimates_page(realm_id, since, start_position).await,
            EntityType::Item => self.items_page(realm_id, since, start_position).await,
        }
    }
}

async fn check_status(response: Response) -> Result<Response, QboError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(QboError::Upstream { status, body })
}

/// Build the incremental query for one page.
pub fn build_query(
    entity: EntityType,
    since: Option<DateTime<Utc>>,
    start_position: u32,
    max_results: u32,
) -> String {
    let filter = match since {
        Some(ts) => format!(
            " WHERE Metadata.LastUpdatedTime >= '{}'",
            ts.to_rfc3339_opts(SecondsFormat::Secs, false)
        ),
        None => String::new(),
    };
    format!(
        "SELECT * FROM {}{} ORDERBY Metadata.LastUpdatedTime STARTPOSITION {} MAXRESULTS {}",
        entity.qbo_name(),
        filter,
        start_position,
        max_results
    )
}
