pub mod handlers;
pub mod requests;
pub mod responses;

use axum::routing::{get, put};
use axum::Router;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/calendar/events",
            get(handlers::list_events).post(handlers::create_event),
        )
        .route(
            "/api/calendar/events/{id}",
            get(handlers::get_event)
                .put(handlers::update_event)
                .delete(handlers::delete_event),
        )
        .route(
            "/api/calendar/events/{id}/assignments",
            get(handlers::list_assignments).post(handlers::create_assignment),
        )
        .route(
            "/api/assignments/{id}",
            put(handlers::update_assignment).delete(handlers::delete_assignment),
        )
        .route(
            "/api/employees/{id}/assignments",
            get(handlers::list_employee_assignments),
        )
}
