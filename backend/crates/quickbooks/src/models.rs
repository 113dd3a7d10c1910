use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use opsdesk_db::entities::models::{EntityType, MirroredEntity};

use crate::error::QboError;

/// Fields shared by every QuickBooks record that the local mirror indexes.
/// The full record is kept verbatim as the payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RecordHeader {
    pub id: String,
    pub sync_token: Option<String>,
    pub meta_data: Option<RecordMetaData>,
    pub display_name: Option<String>,
    pub name: Option<String>,
    pub doc_number: Option<String>,
    pub total_amt: Option<f64>,
    pub balance: Option<f64>,
    pub unit_price: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RecordMetaData {
    pub create_time: Option<DateTime<Utc>>,
    pub last_updated_time: Option<DateTime<Utc>>,
}

impl RecordHeader {
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.meta_data.as_ref().and_then(|m| m.last_updated_time)
    }
}

/// Extract the records of `entity` from a query endpoint response.
///
/// An empty `QueryResponse` object means no rows matched.
pub fn query_rows(entity: EntityType, mut body: Value) -> Result<Vec<Value>, QboError> {
    let response = body
        .get_mut("QueryResponse")
        .ok_or_else(|| QboError::Decode("missing QueryResponse".to_string()))?;

    match response.get_mut(entity.qbo_name()).map(Value::take) {
        Some(Value::Array(rows)) => Ok(rows),
        Some(Value::Null) | None => Ok(Vec::new()),
        Some(other) => Err(QboError::Decode(format!(
            "expected array for {}, got {other}",
            entity.qbo_name()
        ))),
    }
}

/// Map a raw QuickBooks record to its local mirror row.
pub fn to_mirrored(
    realm_id: &str,
    entity: EntityType,
    record: Value,
    synced_at: DateTime<Utc>,
) -> Result<MirroredEntity, QboError> {
    let header: RecordHeader = serde_json::from_value(record.clone())
        .map_err(|e| QboError::Decode(format!("{} record: {e}", entity.qbo_name())))?;

    let (display_name, total_amount) = match entity {
        EntityType::Customer => (header.display_name.clone(), header.balance),
        EntityType::Invoice | EntityType::Estimate => (header.doc_number.clone(), header.total_amt),
        EntityType::Item => (header.name.clone(), header.unit_price),
    };

    Ok(MirroredEntity {
        id: Uuid::new_v4(),
        realm_id: realm_id.to_string(),
        entity_type: entity,
        remote_updated_at: header.last_updated(),
        external_id: header.id,
        sync_token: header.sync_token,
        display_name,
        total_amount,
        payload: record,
        synced_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_rows_extracts_entity_array() {
        let body = json!({
            "QueryResponse": {
                "Customer": [{"Id": "1"}, {"Id": "2"}],
                "startPosition": 1,
                "maxResults": 2
            },
            "time": "2024-03-01T10:00:00.000-08:00"
        });
        let rows = query_rows(EntityType::Customer, body).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn empty_query_response_means_no_rows() {
        let body = json!({"QueryResponse": {}, "time": "2024-03-01T10:00:00.000-08:00"});
        assert!(query_rows(EntityType::Invoice, body).unwrap().is_empty());
    }

    #[test]
    fn missing_query_response_is_decode_error() {
        let body = json!({"Fault": {"Error": [{"Message": "bad query"}]}});
        assert!(matches!(
            query_rows(EntityType::Item, body),
            Err(QboError::Decode(_))
        ));
    }

    #[test]
    fn invoice_maps_doc_number_and_total() {
        let record = json!({
            "Id": "130",
            "SyncToken": "3",
            "DocNumber": "1037",
            "TotalAmt": 362.07,
            "MetaData": {
                "CreateTime": "2024-01-10T13:16:17-08:00",
                "LastUpdatedTime": "2024-02-01T09:00:00-08:00"
            }
        });
        let synced_at = Utc::now();
        let entity = to_mirrored("123", EntityType::Invoice, record.clone(), synced_at).unwrap();

        assert_eq!(entity.external_id, "130");
        assert_eq!(entity.sync_token.as_deref(), Some("3"));
        assert_eq!(entity.display_name.as_deref(), Some("1037"));
        assert_eq!(entity.total_amount, Some(362.07));
        assert_eq!(
            entity.remote_updated_at.map(|t| t.to_rfc3339()),
            Some("2024-02-01T17:00:00+00:00".to_string())
        );
        assert_eq!(entity.payload, record);
    }

    #[test]
    fn customer_maps_display_name() {
        let record = json!({"Id": "58", "DisplayName": "Amy's Bird Sanctuary", "Balance": 239.0});
        let entity = to_mirrored("123", EntityType::Customer, record, Utc::now()).unwrap();
        assert_eq!(entity.display_name.as_deref(), Some("Amy's Bird Sanctuary"));
        assert_eq!(entity.total_amount, Some(239.0));
        assert!(entity.remote_updated_at.is_none());
    }

    #[test]
    fn record_without_id_rejected() {
        let record = json!({"DisplayName": "No id"});
        assert!(to_mirrored("123", EntityType::Customer, record, Utc::now()).is_err());
    }
}
