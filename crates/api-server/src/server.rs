//! API server: HTTP REST router and the Prometheus exporter.

use crate::rest::{self, AppState, TaxDefaults};
use crate::{calendar_rest, sequence_rest, tax_rest};
use axum::routing::{get, patch, post, put};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use studio_calendar::CalendarBook;
use studio_core::config::AppConfig;
use studio_sequences::{SequenceProcessor, SequenceService};
use studio_tax::{ActivityType, TaxYearRules};
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Build the full REST router over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Sequences and steps
        .route(
            "/v1/sequences",
            get(sequence_rest::list_sequences).post(sequence_rest::create_sequence),
        )
        .route("/v1/sequences/process", post(sequence_rest::process_sequences))
        .route(
            "/v1/sequences/:id",
            get(sequence_rest::get_sequence).delete(sequence_rest::delete_sequence),
        )
        .route("/v1/sequences/:id/toggle", post(sequence_rest::toggle_sequence))
        .route("/v1/sequences/:id/steps", post(sequence_rest::add_step))
        .route("/v1/sequences/:id/steps/reorder", put(sequence_rest::reorder_steps))
        .route(
            "/v1/sequences/:id/steps/:order",
            patch(sequence_rest::update_step).delete(sequence_rest::delete_step),
        )
        .route("/v1/sequences/:id/stats", get(sequence_rest::sequence_stats))
        // Customers and enrollments
        .route("/v1/customers", post(sequence_rest::upsert_customer))
        .route(
            "/v1/enrollments",
            get(sequence_rest::list_enrollments).post(sequence_rest::enroll),
        )
        .route(
            "/v1/enrollments/:id/unsubscribe",
            post(sequence_rest::unsubscribe_enrollment),
        )
        .route("/v1/enrollments/:id/resume", post(sequence_rest::resume_enrollment))
        .route("/unsubscribe", get(sequence_rest::unsubscribe_link))
        // Tax
        .route("/v1/tax/calculate", post(tax_rest::calculate_tax))
        .route("/v1/tax/vat", post(tax_rest::calculate_vat_liability))
        // Calendar
        .route(
            "/v1/calendar/events",
            get(calendar_rest::list_events).post(calendar_rest::create_event),
        )
        .route("/v1/calendar/events/:id/cancel", post(calendar_rest::cancel_event))
        .route("/v1/calendar/feed.ics", get(calendar_rest::ics_feed))
        // Operational endpoints
        .route("/health", get(rest::health_check))
        .route("/ready", get(rest::readiness))
        .route("/live", get(rest::liveness))
        // Middleware
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Main API server.
pub struct ApiServer {
    config: AppConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(
        config: AppConfig,
        service: SequenceService,
        processor: Arc<SequenceProcessor>,
        calendar: Arc<CalendarBook>,
    ) -> anyhow::Result<Self> {
        let activity: ActivityType = config.tax.activity.parse()?;
        let state = AppState {
            service,
            processor,
            calendar,
            tax_rules: Arc::new(TaxYearRules::cz_2024()),
            tax_defaults: TaxDefaults {
                activity,
                apply_taxpayer_credit: config.tax.apply_taxpayer_credit,
            },
            calendar_name: config.email.from_name.clone(),
            node_id: config.node_id.clone(),
            start_time: Instant::now(),
        };
        Ok(Self { config, state })
    }

    /// Start the HTTP REST server.
    pub async fn start_http(&self) -> anyhow::Result<()> {
        let app = router(self.state.clone());

        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);

        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }

    /// Start the metrics server on a separate port.
    pub fn start_metrics(&self) -> anyhow::Result<()> {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}
