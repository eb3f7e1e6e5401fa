use std::net::SocketAddr;

use opentelemetry::global;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

const OTLP_ENDPOINT: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let endpoint = std::env::var(OTLP_ENDPOINT).ok();

    // Export traces and logs only when a collector is known.
    let (bridge, logger) = match endpoint.as_deref().map(contacta::telemetry::setup_logging) {
        Some(Ok((bridge, provider))) => (Some(bridge), Some(provider)),
        Some(Err(err)) => {
            eprintln!("cannot export logs: {err}");
            (None, None)
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .with(bridge)
        .init();

    if endpoint.is_some() {
        match contacta::telemetry::setup_tracer() {
            Ok(provider) => {
                global::set_tracer_provider(provider);
            },
            Err(err) => tracing::error!(error = %err, "cannot export traces"),
        }
    }

    let state = contacta::initialize_state().await?;
    let port = state.config.port;

    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    tracing::info!(%port, "server listening");

    axum::serve(
        listener,
        contacta::app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    if let Some(provider) = logger {
        if let Err(err) = provider.shutdown() {
            tracing::warn!(error = %err, "log exporter shutdown failed");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "cannot listen for shutdown signal");
    }

    tracing::info!("shutting down");
}
