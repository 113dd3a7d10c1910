use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Idle,
    Running,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown sync status: {value}")),
        }
    }
}

/// Per (realm, entity type) bookkeeping for incremental sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    pub id: Uuid,
    pub realm_id: String,
    pub entity_type: String,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Highest upstream `LastUpdatedTime` applied by a completed pass.
    pub watermark: Option<DateTime<Utc>>,
    pub status: SyncStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
