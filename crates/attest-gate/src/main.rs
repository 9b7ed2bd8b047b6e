//! Attestation Gate Binary
//!
//! Runs the attestation gate HTTP server and admission webhook.

use std::error::Error;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::FmtSubscriber;

use attest_core::{MemoryStore, OccurrenceStore};
use attest_gate::{create_router, AppState, GateConfig, GateError, GrafeasStore};
use attest_stream::{DurableLog, MemoryLog};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = GateConfig::from_env()?;

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.log_level)
        .with_target(true)
        .with_thread_ids(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    // Fact store
    let store: Arc<dyn OccurrenceStore> = match &config.grafeas_url {
        Some(url) => {
            info!(url = %url, project = %config.grafeas_project, "Using Grafeas store");
            Arc::new(GrafeasStore::new(url.clone(), config.grafeas_project.clone()))
        }
        None => {
            warn!("No Grafeas URL configured, facts are kept in memory");
            Arc::new(MemoryStore::with_project(config.grafeas_project.clone()))
        }
    };

    let log = durable_log(&config).await?;

    info!(
        port = config.port,
        resolution = ?config.resolution,
        excluded = ?config.excluded_namespaces,
        ingest_stream = config.ingest_stream,
        "Starting attestation gate"
    );

    let state = Arc::new(AppState::new(config.clone(), store, log));
    let app = create_router(state.clone());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(addr = %addr, "Attestation gate listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.events.shutdown().await;
    info!("Attestation gate stopped");

    Ok(())
}

#[cfg(feature = "nats")]
async fn durable_log(config: &GateConfig) -> Result<Arc<dyn DurableLog>, GateError> {
    match &config.nats_url {
        Some(url) => {
            info!(url = %url, "Using NATS JetStream log");
            Ok(Arc::new(attest_stream::NatsLog::connect(url).await?))
        }
        None => Ok(in_memory_log()),
    }
}

#[cfg(not(feature = "nats"))]
async fn durable_log(config: &GateConfig) -> Result<Arc<dyn DurableLog>, GateError> {
    match &config.nats_url {
        Some(_) => Err(GateError::Config(
            "ATTEST_GATE_NATS_URL is set but the binary was built without the 'nats' feature"
                .into(),
        )),
        None => Ok(in_memory_log()),
    }
}

fn in_memory_log() -> Arc<dyn DurableLog> {
    warn!("No NATS URL configured, the event stream is kept in memory");
    Arc::new(MemoryLog::new())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
