use opsdesk_common::error::{OpsError, OpsResult};
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub cors_origins: Vec<String>,
    pub webhook: WebhookConfig,
}

/// Secrets used to authenticate inbound webhook deliveries.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookConfig {
    /// Intuit webhook verifier token (HMAC key for `intuit-signature`).
    pub qbo_verifier_token: Option<String>,
    /// Shared secret expected in `x-webhook-secret` for database webhooks.
    pub shared_secret: Option<String>,
    /// Reject deliveries that fail verification instead of logging them.
    pub strict: bool,
}

impl AppConfig {
    /// Load configuration from environment variables.
    /// Loads `.env` file if present, then reads required vars.
    pub fn from_env() -> OpsResult<Self> {
        // Best-effort .env load; ignore if missing
        let _ = dotenvy::dotenv();

        Ok(Self {
            database_url: get_var("DATABASE_URL")?,
            host: get_var_or("HOST", "0.0.0.0"),
            port: get_var_or("PORT", "8080")
                .parse()
                .map_err(|e| OpsError::Config(format!("invalid PORT: {e}")))?,
            log_level: get_var_or("LOG_LEVEL", "info"),
            cors_origins: parse_csv(&get_var_or(
                "CORS_ORIGINS",
                "http://localhost:3000,http://127.0.0.1:3000",
            )),
            webhook: WebhookConfig::from_env()?,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl WebhookConfig {
    pub fn from_env() -> OpsResult<Self> {
        let strict = parse_bool("WEBHOOK_STRICT", &get_var_or("WEBHOOK_STRICT", "true"))?;
        Ok(Self {
            qbo_verifier_token: get_non_empty("QBO_WEBHOOK_VERIFIER_TOKEN"),
            shared_secret: get_non_empty("WEBHOOK_SHARED_SECRET"),
            strict,
        })
    }
}

fn get_var(key: &str) -> OpsResult<String> {
    env::var(key).map_err(|_| OpsError::Config(format!("{key} is required but not set")))
}

fn get_var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn get_non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

fn parse_bool(key: &str, raw: &str) -> OpsResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(OpsError::Config(format!("invalid {key}: {other}"))),
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn config_from_env_succeeds_with_required_vars() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");

        env::set_var("DATABASE_URL", "postgres://localhost/opsdesk_test");
        env::remove_var("WEBHOOK_STRICT");

        let cfg = AppConfig::from_env().expect("should parse config");
        assert_eq!(cfg.database_url, "postgres://localhost/opsdesk_test");
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.log_level, "info");
        assert!(cfg.webhook.strict);

        env::remove_var("DATABASE_URL");
    }

    #[test]
    fn config_from_env_fails_without_database_url() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");

        env::remove_var("DATABASE_URL");
        let result = AppConfig::from_env();
        assert!(result.is_err());
    }

    #[test]
    fn webhook_strict_accepts_false() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");

        env::set_var("WEBHOOK_STRICT", "false");
        env::set_var("WEBHOOK_SHARED_SECRET", "  s3cret ");
        let cfg = WebhookConfig::from_env().expect("should parse");
        assert!(!cfg.strict);
        assert_eq!(cfg.shared_secret.as_deref(), Some("s3cret"));

        env::remove_var("WEBHOOK_STRICT");
        env::remove_var("WEBHOOK_SHARED_SECRET");
    }

    #[test]
    fn webhook_strict_rejects_garbage() {
        assert!(parse_bool("WEBHOOK_STRICT", "maybe").is_err());
    }

    #[test]
    fn bind_addr_formats_correctly() {
        let cfg = AppConfig {
            database_url: String::new(),
            host: "127.0.0.1".to_owned(),
            port: 3000,
            log_level: "debug".to_owned(),
            cors_origins: vec![],
            webhook: WebhookConfig::default(),
        };
        assert_eq!(cfg.bind_addr(), "127.0.0.1:3000");
    }

    #[test]
    fn csv_skips_blank_entries() {
        assert_eq!(
            parse_csv("http://a, ,http://b,"),
            vec!["http://a".to_string(), "http://b".to_string()]
        );
    }
}
