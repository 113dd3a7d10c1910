use opsdesk_db::calendar::models::{CalendarEvent, WorkAssignment};
use serde::Serialize;

/// An event together with its ordered assignments.
#[derive(Debug, Serialize)]
pub struct EventDetailResponse {
    #[serde(flatten)]
    pub event: CalendarEvent,
    pub assignments: Vec<WorkAssignment>,
}
