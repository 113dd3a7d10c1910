use async_trait::async_trait;
use uuid::Uuid;

use crate::calendar::models::{CalendarEvent, EventFilter, WorkAssignment};
use opsdesk_common::error::OpsResult;

#[async_trait]
pub trait CalendarRepository: Send + Sync {
    async fn list_events(&self, filter: EventFilter) -> OpsResult<(Vec<CalendarEvent>, i64)>;
    async fn get_event(&self, id: Uuid) -> OpsResult<Option<CalendarEvent>>;
    async fn create_event(&self, event: CalendarEvent) -> OpsResult<CalendarEvent>;
    async fn update_event(&self, event: CalendarEvent) -> OpsResult<CalendarEvent>;
    /// Deletes the event and, by cascade, its assignments.
    async fn delete_event(&self, id: Uuid) -> OpsResult<()>;

    /// Assignments for one event ordered by `sequence_order`, then creation time.
    async fn list_assignments(&self, event_id: Uuid) -> OpsResult<Vec<WorkAssignment>>;
    async fn list_assignments_for_employee(
        &self,
        employee_id: Uuid,
    ) -> OpsResult<Vec<WorkAssignment>>;
    async fn get_assignment(&self, id: Uuid) -> OpsResult<Option<WorkAssignment>>;
    /// Fails with `Conflict` when the employee is already assigned to the event.
    async fn create_assignment(&self, assignment: WorkAssignment) -> OpsResult<WorkAssignment>;
    async fn update_assignment(&self, assignment: WorkAssignment) -> OpsResult<WorkAssignment>;
    async fn delete_assignment(&self, id: Uuid) -> OpsResult<()>;
}
