//! Queue Dashboard Server
//!
//! Serves the dashboard API for deleting, sending and moving single
//! RabbitMQ messages, plus `/health` and Prometheus `/metrics`.
//!
//! Broker settings come from the config file and `RABBITMQ_*` variables,
//! see `mq-config`. A `.env` file in the working directory is loaded first.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `MQ_DASHBOARD_CONFIG` | - | Optional TOML config file |
//! | `MQ_DASHBOARD_LOG_FORMAT` | `text` | `text` or `json` |
//! | `RUST_LOG` | `info` | Log level |

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mq_broker::{AmqpConnector, MessageOperations, OperationSettings};
use mq_config::DashboardConfig;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Queue Dashboard Server
#[derive(Parser, Debug)]
#[command(name = "mq-dashboard")]
#[command(about = "Targeted single-message operations for RabbitMQ queues")]
struct Args {
    /// TOML config file
    #[arg(long, env = "MQ_DASHBOARD_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen address, overrides the config
    #[arg(long)]
    bind: Option<String>,

    /// Log output format
    #[arg(long, env = "MQ_DASHBOARD_LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    init_tracing(args.log_format);

    info!("Starting Queue Dashboard");

    let mut config = DashboardConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(bind) = args.bind {
        config.http.bind = bind;
    }
    info!(
        broker = %config.broker.redacted_uri(),
        grace_period_ms = config.operations.delete_timeout_ms,
        scan_idle_timeout_ms = config.operations.scan_idle_timeout_ms,
        "Configuration loaded"
    );

    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;

    let connector = Arc::new(AmqpConnector::new(config.broker.clone()));
    let operations = MessageOperations::new(connector, OperationSettings::from(&config.operations));

    let app = mq_api::create_router(operations)
        .route(
            "/metrics",
            axum::routing::get(move || metrics_handler(metrics.clone())),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let addr: SocketAddr = config
        .http
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address: {}", config.http.bind))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Dashboard API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Queue Dashboard shutdown complete");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());

    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

async fn metrics_handler(handle: PrometheusHandle) -> String {
    handle.render()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
