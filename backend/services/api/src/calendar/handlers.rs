use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::Utc;
use opsdesk_common::error::OpsError;
use opsdesk_db::calendar::models::{AssignmentStatus, CalendarEvent, EventFilter, WorkAssignment};
use opsdesk_db::calendar::repositories::CalendarRepository;
use uuid::Uuid;

use crate::calendar::requests::{
    CreateAssignmentRequest, CreateEventRequest, EventListQuery, UpdateAssignmentRequest,
    UpdateEventRequest,
};
use crate::calendar::responses::EventDetailResponse;
use crate::envelope::{page_bounds, ApiResponse};
use crate::error::ApiError;
use crate::extractors::{ApiJson, ApiPath, ApiQuery};
use crate::AppState;

fn validate_event(event: &CalendarEvent) -> Result<(), OpsError> {
    if event.title.trim().is_empty() {
        return Err(OpsError::Validation("title must not be empty".to_string()));
    }
    if event.end_at < event.start_at {
        return Err(OpsError::Validation(
            "end_at must not be before start_at".to_string(),
        ));
    }
    Ok(())
}

fn validate_sequence(order: i32) -> Result<(), OpsError> {
    if order < 0 {
        return Err(OpsError::Validation(format!(
            "sequence_order must be non-negative, got {order}"
        )));
    }
    Ok(())
}

fn next_sequence(existing: &[WorkAssignment]) -> Result<i32, OpsError> {
    match existing.iter().map(|a| a.sequence_order).max() {
        None => Ok(1),
        Some(last) => last.checked_add(1).ok_or_else(|| {
            OpsError::Validation(
                "sequence_order is exhausted for this event; pass one explicitly".to_string(),
            )
        }),
    }
}

async fn require_event(state: &AppState, id: Uuid) -> Result<CalendarEvent, ApiError> {
    state
        .calendar
        .get_event(id)
        .await?
        .ok_or_else(|| ApiError(OpsError::NotFound(format!("event not found: {id}"))))
}

// ── Events ──────────────────────────────────────────────────────

pub async fn list_events(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<EventListQuery>,
) -> Result<ApiResponse<Vec<CalendarEvent>>, ApiError> {
    let (limit, offset) = page_bounds(query.limit, query.offset);
    let filter = EventFilter {
        from: query.from,
        to: query.to,
        limit: Some(limit),
        offset: Some(offset),
    };
    let (events, total) = state.calendar.list_events(filter).await?;
    Ok(ApiResponse::page(events, total, limit, offset))
}

pub async fn get_event(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<ApiResponse<EventDetailResponse>, ApiError> {
    let event = require_event(&state, id).await?;
    let assignments = state.calendar.list_assignments(id).await?;
    Ok(ApiResponse::ok(EventDetailResponse { event, assignments }))
}

pub async fn create_event(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<CreateEventRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();
    let event = CalendarEvent {
        id: Uuid::new_v4(),
        title: body.title.trim().to_string(),
        description: body.description,
        location: body.location,
        start_at: body.start_at,
        end_at: body.end_at,
        all_day: body.all_day,
        created_by: body.created_by,
        created_at: now,
        updated_at: now,
    };
    validate_event(&event)?;

    let created = state.calendar.create_event(event).await?;
    tracing::info!(event_id = %created.id, "calendar event created");
    Ok((StatusCode::CREATED, ApiResponse::ok(created)))
}

pub async fn update_event(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(body): ApiJson<UpdateEventRequest>,
) -> Result<ApiResponse<CalendarEvent>, ApiError> {
    let existing = require_event(&state, id).await?;

    let event = CalendarEvent {
        title: body
            .title
            .map(|t| t.trim().to_string())
            .unwrap_or(existing.title),
        description: body.description.or(existing.description),
        location: body.location.or(existing.location),
        start_at: body.start_at.unwrap_or(existing.start_at),
        end_at: body.end_at.unwrap_or(existing.end_at),
        all_day: body.all_day.unwrap_or(existing.all_day),
        updated_at: Utc::now(),
        ..existing
    };
    validate_event(&event)?;

    let updated = state.calendar.update_event(event).await?;
    Ok(ApiResponse::ok(updated))
}

pub async fn delete_event(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<ApiResponse<()>, ApiError> {
    state.calendar.delete_event(id).await?;
    tracing::info!(event_id = %id, "calendar event deleted");
    Ok(ApiResponse::message("event deleted"))
}

// ── Assignments ─────────────────────────────────────────────────

pub async fn list_assignments(
    State(state): State<AppState>,
    ApiPath(event_id): ApiPath<Uuid>,
) -> Result<ApiResponse<Vec<WorkAssignment>>, ApiError> {
    require_event(&state, event_id).await?;
    let assignments = state.calendar.list_assignments(event_id).await?;
    Ok(ApiResponse::ok(assignments))
}

pub async fn create_assignment(
    State(state): State<AppState>,
    ApiPath(event_id): ApiPath<Uuid>,
    ApiJson(body): ApiJson<CreateAssignmentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_event(&state, event_id).await?;

    let sequence_order = match body.sequence_order {
        Some(order) => order,
        None => next_sequence(&state.calendar.list_assignments(event_id).await?)?,
    };
    validate_sequence(sequence_order)?;

    let now = Utc::now();
    let assignment = WorkAssignment {
        id: Uuid::new_v4(),
        event_id,
        employee_id: body.employee_id,
        role: body.role,
        status: body.status.unwrap_or(AssignmentStatus::Scheduled),
        sequence_order,
        notes: body.notes,
        created_at: now,
        updated_at: now,
    };

    let created = state.calendar.create_assignment(assignment).await?;
    tracing::info!(
        assignment_id = %created.id,
        event_id = %event_id,
        employee_id = %created.employee_id,
        "work assignment created"
    );
    Ok((StatusCode::CREATED, ApiResponse::ok(created)))
}

pub async fn update_assignment(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(body): ApiJson<UpdateAssignmentRequest>,
) -> Result<ApiResponse<WorkAssignment>, ApiError> {
    let existing = state
        .calendar
        .get_assignment(id)
        .await?
        .ok_or_else(|| ApiError(OpsError::NotFound(format!("assignment not found: {id}"))))?;

    let sequence_order = body.sequence_order.unwrap_or(existing.sequence_order);
    validate_sequence(sequence_order)?;

    let assignment = WorkAssignment {
        role: body.role.or(existing.role),
        status: body.status.unwrap_or(existing.status),
        notes: body.notes.or(existing.notes),
        sequence_order,
        updated_at: Utc::now(),
        ..existing
    };

    let updated = state.calendar.update_assignment(assignment).await?;
    Ok(ApiResponse::ok(updated))
}

pub async fn delete_assignment(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<ApiResponse<()>, ApiError> {
    state.calendar.delete_assignment(id).await?;
    Ok(ApiResponse::message("assignment deleted"))
}

pub async fn list_employee_assignments(
    State(state): State<AppState>,
    ApiPath(employee_id): ApiPath<Uuid>,
) -> Result<ApiResponse<Vec<WorkAssignment>>, ApiError> {
    let assignments = state
        .calendar
        .list_assignments_for_employee(employee_id)
        .await?;
    Ok(ApiResponse::ok(assignments))
}
