//! Shared REST state, error mapping and operational endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use studio_calendar::CalendarBook;
use studio_core::StudioError;
use studio_sequences::{SequenceProcessor, SequenceService};
use studio_tax::{ActivityType, TaxYearRules};
use tracing::error;

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: SequenceService,
    pub processor: Arc<SequenceProcessor>,
    pub calendar: Arc<CalendarBook>,
    pub tax_rules: Arc<TaxYearRules>,
    pub tax_defaults: TaxDefaults,
    pub calendar_name: String,
    pub node_id: String,
    pub start_time: Instant,
}

/// Values applied when a tax request omits them.
#[derive(Debug, Clone, Copy)]
pub struct TaxDefaults {
    pub activity: ActivityType,
    pub apply_taxpayer_credit: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// A `StudioError` on its way out of a handler.
#[derive(Debug)]
pub struct ApiError(pub StudioError);

impl From<StudioError> for ApiError {
    fn from(err: StudioError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            StudioError::NotFound { .. } => StatusCode::NOT_FOUND,
            StudioError::Validation(_) | StudioError::Serialization(_) => StatusCode::BAD_REQUEST,
            StudioError::Conflict(_) => StatusCode::CONFLICT,
            StudioError::Email(_) => StatusCode::BAD_GATEWAY,
            StudioError::Config(_)
            | StudioError::Store(_)
            | StudioError::Io(_)
            | StudioError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match &self.0 {
            StudioError::NotFound { .. } => "not_found",
            StudioError::Validation(_) | StudioError::Serialization(_) => "invalid_request",
            StudioError::Conflict(_) => "conflict",
            StudioError::Email(_) => "email_provider_error",
            _ => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "Request failed");
            metrics::counter!("api.errors").increment(1);
            "Internal processing error".to_string()
        } else {
            metrics::counter!("api.client_errors").increment(1);
            self.0.to_string()
        };
        let body = ErrorResponse {
            error: self.code().to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
    pub sequences: usize,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        sequences: state.service.list_sequences().len(),
    })
}

/// GET /ready
pub async fn readiness(State(_state): State<AppState>) -> StatusCode {
    StatusCode::OK
}

/// GET /live
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}
