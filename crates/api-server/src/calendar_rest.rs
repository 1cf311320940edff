//! Booking calendar endpoints and the subscribable ICS feed.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use studio_calendar::{CalendarEvent, NewCalendarEvent};
use uuid::Uuid;

use crate::rest::{ApiResult, AppState};

/// GET /v1/calendar/events
pub async fn list_events(State(state): State<AppState>) -> Json<Vec<CalendarEvent>> {
    Json(state.calendar.list())
}

/// POST /v1/calendar/events
pub async fn create_event(
    State(state): State<AppState>,
    Json(req): Json<NewCalendarEvent>,
) -> ApiResult<(StatusCode, Json<CalendarEvent>)> {
    let event = state.calendar.add(req)?;
    Ok((StatusCode::CREATED, Json(event)))
}

/// POST /v1/calendar/events/:id/cancel
pub async fn cancel_event(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CalendarEvent>> {
    Ok(Json(state.calendar.cancel(id)?))
}

/// GET /v1/calendar/feed.ics
pub async fn ics_feed(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.calendar.feed(&state.calendar_name).render();
    (
        [
            (header::CONTENT_TYPE, "text/calendar; charset=utf-8"),
            (header::CONTENT_DISPOSITION, "inline; filename=\"calendar.ics\""),
        ],
        body,
    )
}
