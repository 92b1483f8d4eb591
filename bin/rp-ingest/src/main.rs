//! Reporting Ingestion Service
//!
//! Consumes reporting messages from RabbitMQ partition queues and dispatches
//! them to the reporting backend, with a retry ladder, a parking lot and idle
//! queue reclamation. Exposes `/health` and `/metrics`.
//!
//! Configuration is read from the TOML file named by `RP_CONFIG_FILE` (or the
//! first argument), then overridden by `RP_*` environment variables.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use rp_broker::{AmqpBroker, ManagementClient, ManagementConfig};
use rp_config::IngestConfig;
use rp_pipeline::{
    HandlerRegistry, HttpHandler, HttpHandlerConfig, IngestManager, NodeIdentity, PipelineHealth,
    RetryCatalog,
};
use serde_json::{json, Value};
use tokio::{net::TcpListener, signal};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    info!("Starting Reporting Ingestion Service");

    // 1. Configuration
    let config_path = std::env::var("RP_CONFIG_FILE")
        .ok()
        .or_else(|| std::env::args().nth(1))
        .map(PathBuf::from);
    let config = IngestConfig::load(config_path.as_deref()).context("Failed to load configuration")?;

    // 2. Metrics recorder
    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;

    // 3. Broker connections
    let admin = Arc::new(ManagementClient::new(ManagementConfig {
        base_url: config.broker.management_url.clone(),
        username: config.broker.username.clone(),
        password: config.broker.password.clone(),
        virtual_host: config.broker.virtual_host.clone(),
        ..Default::default()
    })?);

    let uris: Vec<String> = config
        .broker
        .addresses
        .iter()
        .map(|address| config.broker.amqp_uri(address))
        .collect();
    let broker = Arc::new(AmqpBroker::connect(&uris).await?);

    // 4. Handler provider
    let http_handler = Arc::new(HttpHandler::new(HttpHandlerConfig::from(&config.handler))?);
    let mut handlers = HandlerRegistry::new(RetryCatalog::default());
    handlers.register_all(http_handler);
    info!(backend = %config.handler.base_url, "Reporting backend configured");

    // 5. HTTP listener, bound before any broker resources are claimed
    let listener = bind_listener(&format!("0.0.0.0:{}", config.server.port)).await?;

    // 6. Pipeline
    let manager = Arc::new(IngestManager::new(
        config.clone(),
        admin,
        broker.clone(),
        broker.clone(),
        Arc::new(handlers),
    ));
    let topology = manager.start(NodeIdentity::generate()).await?;
    info!(
        suffix = %topology.identity.suffix(),
        queues = ?topology.queues,
        "Partition queues ready"
    );

    // 7. Health and metrics server
    let state = AppState {
        manager: manager.clone(),
        broker: broker.clone(),
        prometheus,
    };
    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    info!(port = config.server.port, "Starting HTTP server");
    let server_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "HTTP server failed");
        }
    });

    info!("Reporting Ingestion Service started. Press Ctrl+C to shutdown.");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    // Graceful shutdown
    match tokio::time::timeout(Duration::from_secs(60), manager.shutdown()).await {
        Ok(Some(report)) if !report.is_clean() => {
            warn!(failures = ?report.failures, "Shutdown incomplete");
        }
        Ok(_) => {}
        Err(_) => warn!("Timed out waiting for pipeline shutdown"),
    }
    if let Err(e) = broker.close().await {
        warn!(error = %e, "Failed to close broker connection");
    }
    server_task.abort();

    info!("Reporting Ingestion Service shutdown complete");
    Ok(())
}

async fn bind_listener(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind HTTP listener on {}", addr))
}

#[derive(Clone)]
struct AppState {
    manager: Arc<IngestManager>,
    broker: Arc<AmqpBroker>,
    prometheus: PrometheusHandle,
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let pipeline = state.manager.health().await;
    health_response(&pipeline, state.broker.is_connected())
}

fn health_response(pipeline: &PipelineHealth, broker_connected: bool) -> (StatusCode, Json<Value>) {
    let up = broker_connected && pipeline.is_up();
    let status = if up { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    let body = json!({
        "status": if up { "UP" } else { "DOWN" },
        "broker": { "connected": broker_connected },
        "consumers": { "queues": pipeline.queues, "subscribed": pipeline.subscribed },
    });
    (status, Json(body))
}

async fn render_metrics(State(state): State<AppState>) -> String {
    state.prometheus.render()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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
}
