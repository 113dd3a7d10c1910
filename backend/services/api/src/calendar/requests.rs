use chrono::{DateTime, Utc};
use opsdesk_db::calendar::models::AssignmentStatus;
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct CreateEventRequest {
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    #[serde(default)]
    pub all_day: bool,
    pub created_by: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateEventRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub all_day: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventListQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateAssignmentRequest {
    pub employee_id: Uuid,
    pub role: Option<String>,
    pub status: Option<AssignmentStatus>,
    /// Appended after the current last assignment when omitted.
    pub sequence_order: Option<i32>,
    pub notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateAssignmentRequest {
    pub role: Option<String>,
    pub status: Option<AssignmentStatus>,
    pub sequence_order: Option<i32>,
    pub notes: Option<String>,
}
