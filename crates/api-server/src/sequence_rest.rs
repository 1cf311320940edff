//! Drip-campaign REST endpoints: sequences, steps, customers, enrollments.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use studio_core::{Customer, StudioError};
use studio_sequences::stats::SequenceStats;
use studio_sequences::types::{
    Enrollment, NewSequence, NewStep, Sequence, SequenceStep, StepUpdate,
};
use studio_sequences::ProcessSummary;
use tracing::info;
use uuid::Uuid;

use crate::rest::{ApiResult, AppState};

#[derive(Debug, Deserialize)]
pub struct NewCustomer {
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub email: String,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EnrollRequest {
    pub sequence_id: Uuid,
    pub customer_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct ReorderRequest {
    pub step_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct UnsubscribeQuery {
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct UnsubscribeResponse {
    pub email: String,
    pub unsubscribed: usize,
}

/// GET /v1/sequences
pub async fn list_sequences(State(state): State<AppState>) -> Json<Vec<Sequence>> {
    Json(state.service.list_sequences())
}

/// POST /v1/sequences
pub async fn create_sequence(
    State(state): State<AppState>,
    Json(req): Json<NewSequence>,
) -> ApiResult<(StatusCode, Json<Sequence>)> {
    let sequence = state.service.create_sequence(req)?;
    metrics::counter!("api.sequences.created").increment(1);
    Ok((StatusCode::CREATED, Json(sequence)))
}

/// GET /v1/sequences/:id
pub async fn get_sequence(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Sequence>> {
    Ok(Json(state.service.get_sequence(id)?))
}

/// DELETE /v1/sequences/:id
pub async fn delete_sequence(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.service.delete_sequence(id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/sequences/:id/toggle
pub async fn toggle_sequence(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Sequence>> {
    Ok(Json(state.service.toggle_active(id)?))
}

/// POST /v1/sequences/:id/steps
pub async fn add_step(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<NewStep>,
) -> ApiResult<(StatusCode, Json<SequenceStep>)> {
    let step = state.service.add_step(id, req)?;
    Ok((StatusCode::CREATED, Json(step)))
}

/// PUT /v1/sequences/:id/steps/reorder
pub async fn reorder_steps(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ReorderRequest>,
) -> ApiResult<Json<Sequence>> {
    Ok(Json(state.service.reorder_steps(id, &req.step_ids)?))
}

/// PATCH /v1/sequences/:id/steps/:order
pub async fn update_step(
    State(state): State<AppState>,
    Path((id, order)): Path<(Uuid, u32)>,
    Json(update): Json<StepUpdate>,
) -> ApiResult<Json<SequenceStep>> {
    let step_id = state
        .service
        .get_sequence(id)?
        .step_at(order)
        .map(|s| s.id)
        .ok_or_else(|| StudioError::not_found("Step", order))?;
    Ok(Json(state.service.update_step(id, step_id, update)?))
}

/// DELETE /v1/sequences/:id/steps/:order
pub async fn delete_step(
    State(state): State<AppState>,
    Path((id, order)): Path<(Uuid, u32)>,
) -> ApiResult<Json<Sequence>> {
    Ok(Json(state.service.delete_step(id, order)?))
}

/// GET /v1/sequences/:id/stats
pub async fn sequence_stats(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SequenceStats>> {
    Ok(Json(state.service.stats(id)?))
}

/// POST /v1/sequences/process: run the processor now.
pub async fn process_sequences(State(state): State<AppState>) -> ApiResult<Json<ProcessSummary>> {
    match state.processor.try_process().await {
        Some(summary) => {
            info!(
                processed = summary.processed,
                sent = summary.sent,
                failed = summary.failed,
                "Manual sequence run finished"
            );
            Ok(Json(summary))
        }
        None => Err(StudioError::Conflict("a sequence run is already in progress".into()).into()),
    }
}

/// POST /v1/customers
pub async fn upsert_customer(
    State(state): State<AppState>,
    Json(req): Json<NewCustomer>,
) -> ApiResult<(StatusCode, Json<Customer>)> {
    let mut customer = Customer::new(req.first_name, req.last_name, req.email);
    customer.organization = req.organization;
    customer.phone = req.phone;
    let customer = state.service.upsert_customer(customer)?;
    Ok((StatusCode::CREATED, Json(customer)))
}

/// GET /v1/enrollments
pub async fn list_enrollments(State(state): State<AppState>) -> Json<Vec<Enrollment>> {
    Json(state.service.list_enrollments(None))
}

/// POST /v1/enrollments
pub async fn enroll(
    State(state): State<AppState>,
    Json(req): Json<EnrollRequest>,
) -> ApiResult<(StatusCode, Json<Enrollment>)> {
    let enrollment = state.service.enroll(req.sequence_id, req.customer_id)?;
    metrics::counter!("api.enrollments.created").increment(1);
    Ok((StatusCode::CREATED, Json(enrollment)))
}

/// POST /v1/enrollments/:id/unsubscribe
pub async fn unsubscribe_enrollment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Enrollment>> {
    Ok(Json(state.service.unsubscribe(id)?))
}

/// POST /v1/enrollments/:id/resume
pub async fn resume_enrollment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Enrollment>> {
    Ok(Json(state.service.resume(id)?))
}

/// GET /unsubscribe?email=, the target of the link rendered into every email.
pub async fn unsubscribe_link(
    State(state): State<AppState>,
    Query(query): Query<UnsubscribeQuery>,
) -> ApiResult<Json<UnsubscribeResponse>> {
    if query.email.trim().is_empty() {
        return Err(StudioError::Validation("email is required".into()).into());
    }
    let unsubscribed = state.service.unsubscribe_email(&query.email)?;
    metrics::counter!("api.unsubscribe_link").increment(1);
    Ok(Json(UnsubscribeResponse {
        email: query.email,
        unsubscribed,
    }))
}
