use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// QuickBooks collections mirrored locally.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Customer,
    Invoice,
    Estimate,
    Item,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [Self::Customer, Self::Invoice, Self::Estimate, Self::Item];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Invoice => "invoice",
            Self::Estimate => "estimate",
            Self::Item => "item",
        }
    }

    /// Entity name as used by the QuickBooks query language and webhooks.
    pub fn qbo_name(&self) -> &'static str {
        match self {
            Self::Customer => "Customer",
            Self::Invoice => "Invoice",
            Self::Estimate => "Estimate",
            Self::Item => "Item",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts `customer`, `Customer`, `customers` and the like.
impl FromStr for EntityType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "customer" | "customers" => Ok(Self::Customer),
            "invoice" | "invoices" => Ok(Self::Invoice),
            "estimate" | "estimates" => Ok(Self::Estimate),
            "item" | "items" => Ok(Self::Item),
            _ => Err(format!("unknown entity type: {value}")),
        }
    }
}

/// An upstream record mirrored locally, keyed by (realm, type, external id).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MirroredEntity {
    pub id: Uuid,
    pub realm_id: String,
    pub entity_type: EntityType,
    pub external_id: String,
    pub sync_token: Option<String>,
    pub display_name: Option<String>,
    pub total_amount: Option<f64>,
    pub remote_updated_at: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
    pub synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EntityFilter {
    pub search: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}
