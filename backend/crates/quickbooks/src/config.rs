use std::env;

pub const SANDBOX_API_BASE_URL: &str = "https://sandbox-quickbooks.api.intuit.com";
pub const PRODUCTION_API_BASE_URL: &str = "https://quickbooks.api.intuit.com";
pub const DEFAULT_AUTH_URL: &str = "https://appcenter.intuit.com/connect/oauth2";
pub const DEFAULT_TOKEN_URL: &str = "https://oauth.platform.intuit.com/oauth2/v1/tokens/bearer";
pub const ACCOUNTING_SCOPE: &str = "com.intuit.quickbooks.accounting";

const MAX_PAGE_SIZE: u32 = 1000;

#[derive(Debug, Clone)]
pub struct QboConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub api_base_url: String,
    pub auth_url: String,
    pub token_url: String,
    pub minor_version: u32,
    pub page_size: u32,
    pub timeout_secs: u64,
    /// Tokens expiring within this many seconds are refreshed before use.
    pub refresh_threshold_secs: i64,
    pub refresh_interval_secs: u64,
    /// Periodic full sync of every connected realm; disabled when `None`.
    pub sync_interval_secs: Option<u64>,
}

impl QboConfig {
    /// Load QuickBooks config from environment.
    ///
    /// Returns `Ok(None)` if the integration is not configured (client id / secret missing).
    /// Returns `Err` if it IS configured but a value is malformed or out of range.
    pub fn from_env() -> Result<Option<Self>, String> {
        let client_id = match non_empty("QBO_CLIENT_ID") {
            Some(v) => v,
            None => return Ok(None),
        };
        let client_secret = match non_empty("QBO_CLIENT_SECRET") {
            Some(v) => v,
            None => return Ok(None),
        };

        let redirect_uri = non_empty("QBO_REDIRECT_URI").ok_or_else(|| {
            "QBO_REDIRECT_URI is required when QuickBooks credentials are set".to_string()
        })?;

        let environment = non_empty("QBO_ENVIRONMENT").unwrap_or_else(|| "sandbox".to_string());
        let api_base_url = match non_empty("QBO_API_BASE_URL") {
            Some(url) => url,
            None => base_url_for(&environment)?.to_string(),
        };

        let page_size = parse_or("QBO_PAGE_SIZE", 100u32)?;
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(format!(
                "QBO_PAGE_SIZE must be between 1 and {MAX_PAGE_SIZE}, got {page_size}"
            ));
        }

        let sync_interval_secs = match non_empty("QBO_SYNC_INTERVAL_SECS") {
            Some(raw) => {
                let secs: u64 = raw
                    .parse()
                    .map_err(|e| format!("invalid QBO_SYNC_INTERVAL_SECS: {e}"))?;
                (secs > 0).then_some(secs)
            }
            None => None,
        };

        let timeout_secs = positive("QBO_TIMEOUT_SECS", parse_or("QBO_TIMEOUT_SECS", 30u64)?)?;
        let refresh_interval_secs = positive(
            "QBO_REFRESH_INTERVAL_SECS",
            parse_or("QBO_REFRESH_INTERVAL_SECS", 300u64)?,
        )?;
        let refresh_threshold_secs: i64 = parse_or("QBO_REFRESH_THRESHOLD_SECS", 600)?;
        if refresh_threshold_secs <= 0
            || chrono::TimeDelta::try_seconds(refresh_threshold_secs).is_none()
        {
            return Err(format!(
                "QBO_REFRESH_THRESHOLD_SECS must be positive, got {refresh_threshold_secs}"
            ));
        }

        Ok(Some(Self {
            client_id,
            client_secret,
            redirect_uri,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            auth_url: non_empty("QBO_AUTH_URL").unwrap_or_else(|| DEFAULT_AUTH_URL.to_string()),
            token_url: non_empty("QBO_TOKEN_URL").unwrap_or_else(|| DEFAULT_TOKEN_URL.to_string()),
            minor_version: parse_or("QBO_MINOR_VERSION", 75)?,
            page_size,
            timeout_secs,
            refresh_threshold_secs,
            refresh_interval_secs,
            sync_interval_secs,
        }))
    }

    pub fn refresh_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.refresh_threshold_secs)
    }
}

/// Map `QBO_ENVIRONMENT` to the accounting API host.
pub fn base_url_for(environment: &str) -> Result<&'static str, String> {
    match environment.trim().to_ascii_lowercase().as_str() {
        "sandbox" => Ok(SANDBOX_API_BASE_URL),
        "production" => Ok(PRODUCTION_API_BASE_URL),
        other => Err(format!(
            "QBO_ENVIRONMENT must be 'sandbox' or 'production', got '{other}'"
        )),
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn positive(key: &str, value: u64) -> Result<u64, String> {
    if value == 0 {
        return Err(format!("{key} must be greater than zero"));
    }
    Ok(value)
}

fn parse_or<T>(key: &str, default: T) -> Result<T, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty(key) {
        Some(raw) => raw.parse().map_err(|e| format!("invalid {key}: {e}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const KEYS: &[&str] = &[
        "QBO_CLIENT_ID",
        "QBO_CLIENT_SECRET",
        "QBO_REDIRECT_URI",
        "QBO_ENVIRONMENT",
        "QBO_API_BASE_URL",
        "QBO_PAGE_SIZE",
        "QBO_SYNC_INTERVAL_SECS",
        "QBO_TIMEOUT_SECS",
        "QBO_REFRESH_INTERVAL_SECS",
        "QBO_REFRESH_THRESHOLD_SECS",
    ];

    fn clear() {
        for key in KEYS {
            env::remove_var(key);
        }
    }

    fn set_credentials() {
        env::set_var("QBO_CLIENT_ID", "client");
        env::set_var("QBO_CLIENT_SECRET", "secret");
        env::set_var("QBO_REDIRECT_URI", "http://localhost:8080/api/quickbooks/callback");
    }

    #[test]
    fn missing_credentials_disable_integration() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");
        clear();

        assert!(QboConfig::from_env().unwrap().is_none());
    }

    #[test]
    fn defaults_to_sandbox() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");
        clear();
        set_credentials();

        let cfg = QboConfig::from_env().unwrap().expect("configured");
        assert_eq!(cfg.api_base_url, SANDBOX_API_BASE_URL);
        assert_eq!(cfg.page_size, 100);
        assert_eq!(cfg.refresh_threshold_secs, 600);
        assert!(cfg.sync_interval_secs.is_none());
        clear();
    }

    #[test]
    fn production_environment_selects_production_host() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");
        clear();
        set_credentials();
        env::set_var("QBO_ENVIRONMENT", "Production");

        let cfg = QboConfig::from_env().unwrap().expect("configured");
        assert_eq!(cfg.api_base_url, PRODUCTION_API_BASE_URL);
        clear();
    }

    #[test]
    fn redirect_uri_is_mandatory_once_configured() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");
        clear();
        set_credentials();
        env::remove_var("QBO_REDIRECT_URI");

        let err = QboConfig::from_env().unwrap_err();
        assert!(err.contains("QBO_REDIRECT_URI"));
        clear();
    }

    #[test]
    fn page_size_out_of_range_rejected() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");
        clear();
        set_credentials();
        env::set_var("QBO_PAGE_SIZE", "5000");

        assert!(QboConfig::from_env().is_err());
        clear();
    }

    #[test]
    fn zero_or_negative_timings_rejected() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");
        for (key, value) in [
            ("QBO_REFRESH_INTERVAL_SECS", "0"),
            ("QBO_TIMEOUT_SECS", "0"),
            ("QBO_REFRESH_THRESHOLD_SECS", "0"),
            ("QBO_REFRESH_THRESHOLD_SECS", "-60"),
            ("QBO_REFRESH_INTERVAL_SECS", "-1"),
        ] {
            clear();
            set_credentials();
            env::set_var(key, value);

            let err = QboConfig::from_env().unwrap_err();
            assert!(err.contains(key), "{key}={value} gave: {err}");
        }
        clear();
    }

    #[test]
    fn unknown_environment_rejected() {
        assert!(base_url_for("staging").is_err());
    }
}
