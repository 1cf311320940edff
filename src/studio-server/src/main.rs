//! Studio server: drip-campaign engine, tax calculator and calendar feed.
//!
//! Main entry point that wires the sequence store, email provider,
//! processor, scheduler and HTTP API together.

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use studio_api::ApiServer;
use studio_calendar::CalendarBook;
use studio_channels::build_sender;
use studio_core::config::AppConfig;
use studio_core::event_bus::TracingSink;
use studio_sequences::{
    InMemorySequenceStore, RetryPolicy, SequenceProcessor, SequenceScheduler, SequenceService,
    TemplateRenderer,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "studio-server")]
#[command(about = "Drip-campaign email sequences, tax calculator and calendar feed")]
#[command(version)]
struct Cli {
    /// Optional TOML config file
    #[arg(long, env = "STUDIO_CONFIG")]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "STUDIO__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "STUDIO__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Seconds between sequence runs (overrides config)
    #[arg(long, env = "STUDIO__SEQUENCES__POLL_INTERVAL_SECS")]
    poll_interval_secs: Option<u64>,

    /// Run a single sequence pass and exit
    #[arg(long, default_value_t = false)]
    once: bool,

    /// Serve the API without the background scheduler
    #[arg(long, default_value_t = false)]
    no_scheduler: bool,

    /// Create demo sequences at startup
    #[arg(long, default_value_t = false)]
    seed_demo: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "studio_server=info,studio_sequences=info,tower_http=info".into()
            }),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Studio server starting up");

    let mut config = AppConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(secs) = cli.poll_interval_secs {
        config.sequences.poll_interval_secs = secs;
    }
    config.validate()?;

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        email_provider = %config.email.provider,
        poll_interval_secs = config.sequences.poll_interval_secs,
        "Configuration loaded"
    );

    let store = Arc::new(InMemorySequenceStore::new());
    let events = Arc::new(TracingSink);
    let service = SequenceService::new(store.clone()).with_event_sink(events.clone());

    if cli.seed_demo {
        let seeded = service.seed_demo_sequences()?;
        info!(count = seeded.len(), "Demo sequences seeded");
    }

    let sender = build_sender(&config.email)?;
    let processor = Arc::new(
        SequenceProcessor::new(store, sender, TemplateRenderer::from_config(&config.app))
            .with_retry_policy(RetryPolicy::from_config(&config.sequences))
            .with_event_sink(events),
    );

    if cli.once {
        let summary = processor.process_email_sequences().await;
        info!(
            processed = summary.processed,
            sent = summary.sent,
            failed = summary.failed,
            completed = summary.completed,
            needs_attention = summary.needs_attention,
            "Single sequence run finished"
        );
        return Ok(());
    }

    let api_server = ApiServer::new(
        config.clone(),
        service,
        processor.clone(),
        Arc::new(CalendarBook::new()),
    )?;

    if let Err(e) = api_server.start_metrics() {
        error!(error = %e, "Failed to start metrics exporter");
    }

    let scheduler = if config.sequences.enabled && !cli.no_scheduler {
        let interval = Duration::from_secs(config.sequences.poll_interval_secs.max(1));
        Some(SequenceScheduler::new(processor, interval).spawn())
    } else {
        info!("Sequence scheduler disabled");
        None
    };

    info!("Studio server is ready to serve traffic");

    let served = api_server.start_http().await;

    if let Some(handle) = scheduler {
        handle.shutdown().await;
    }

    served
}
