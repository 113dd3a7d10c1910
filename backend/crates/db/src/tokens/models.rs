use std::fmt;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

/// A persisted OAuth credential for one QuickBooks realm.
#[derive(Clone, PartialEq, Eq)]
pub struct QboToken {
    pub id: Uuid,
    pub realm_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub refresh_token_expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl QboToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// True when the access token expires within `threshold` of `now`.
    pub fn expires_within(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.expires_at - now < threshold
    }
}

// Token values stay out of logs.
impl fmt::Debug for QboToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QboToken")
            .field("id", &self.id)
            .field("realm_id", &self.realm_id)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("refresh_token_expires_at", &self.refresh_token_expires_at)
            .field("is_active", &self.is_active)
            .field("last_updated", &self.last_updated)
            .finish()
    }
}

/// Token material returned by an OAuth exchange, ready to be stored.
#[derive(Clone)]
pub struct NewToken {
    pub realm_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub refresh_token_expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for NewToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewToken")
            .field("realm_id", &self.realm_id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(expires_at: DateTime<Utc>) -> QboToken {
        let now = Utc::now();
        QboToken {
            id: Uuid::new_v4(),
            realm_id: "123".to_string(),
            access_token: "secret-access".to_string(),
            refresh_token: "secret-refresh".to_string(),
            expires_at,
            refresh_token_expires_at: None,
            is_active: true,
            created_at: now,
            last_updated: now,
        }
    }

    #[test]
    fn expired_when_expiry_in_past() {
        let now = Utc::now();
        assert!(token(now - Duration::seconds(1)).is_expired(now));
        assert!(!token(now + Duration::seconds(1)).is_expired(now));
    }

    #[test]
    fn expires_within_threshold() {
        let now = Utc::now();
        let t = token(now + Duration::minutes(5));
        assert!(t.expires_within(now, Duration::minutes(10)));
        assert!(!t.expires_within(now, Duration::minutes(1)));
    }

    #[test]
    fn debug_redacts_secrets() {
        let rendered = format!("{:?}", token(Utc::now()));
        assert!(!rendered.contains("secret-access"));
        assert!(!rendered.contains("secret-refresh"));
        assert!(rendered.contains("<redacted>"));
    }
}
