// Zephy Ingest - MQTT telemetry ingestion service
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # Zephy Ingest
//!
//! Connects to the MQTT broker, subscribes to every `<location>/<metric>`
//! topic derived from the device registry, coalesces readings, and serves
//! probes, Prometheus metrics and an operator API.
//!
//! ## Usage
//!
//! ```bash
//! # Broker settings from the environment
//! MQTT_BROKER_URL=mqtts://broker.example.com MQTT_USERNAME=zephy MQTT_PASSWORD=secret \
//!     zephy-ingest --registry registry.toml
//!
//! # Full configuration file, custom port
//! zephy-ingest --config zephy.toml --registry registry.toml --port 9090
//!
//! # Pick up registry edits without a restart
//! curl -X POST http://localhost:9100/api/v1/mqtt/reload
//! ```

mod api;
mod metrics;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;
use zephy::{FileRegistry, IngestConfig, IngestError, IngestService, JsonLinesPersister, MqttTransport};

use api::AppState;

/// Zephy telemetry ingestion service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML); defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Device/location registry file (TOML)
    #[arg(short, long)]
    registry: PathBuf,

    /// File receiving one JSON line per stored reading
    #[arg(long, default_value = "readings.jsonl")]
    readings: PathBuf,

    /// Last-activity index file
    #[arg(long, default_value = "last_activity.json")]
    activity: PathBuf,

    /// Port to listen on
    #[arg(short, long, default_value = "9100")]
    port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Error)]
enum StartupError {
    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error("HTTP server error: {0}")]
    Server(#[from] std::io::Error),
}

fn load_config(args: &Args) -> Result<IngestConfig, IngestError> {
    let mut config = match &args.config {
        Some(path) => IngestConfig::from_file(path)?,
        None => IngestConfig::default(),
    };
    config.apply_env()?;
    config.validate()?;
    config.broker.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match args.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        EnvFilter::from_default_env().add_directive(level.into())
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Zephy Ingest v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(args).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), StartupError> {
    let config = load_config(&args)?;

    let registry = Arc::new(FileRegistry::new(&args.registry));
    let persister = Arc::new(JsonLinesPersister::open(&args.readings, &args.activity).await?);
    info!(
        registry = %args.registry.display(),
        readings = %persister.readings_path().display(),
        "Collaborators ready"
    );

    // Transport runs until cancelled; reconnects are handled inside
    let transport_cancel = CancellationToken::new();
    let (transport, events, transport_task) =
        MqttTransport::connect(&config.broker, config.events_capacity, transport_cancel.clone());
    let transport = Arc::new(transport);

    let service = Arc::new(IngestService::new(
        config,
        transport.clone(),
        registry,
        persister,
    ));
    service.start(events).await?;

    let app = api::router(Arc::new(AppState::new(service.clone())));

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!("Starting server on http://{}", addr);
    info!("Metrics endpoint: http://{}/metrics", addr);

    let listener = TcpListener::bind(addr).await?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!("Shutting down");
    service.stop().await;
    transport.disconnect().await;
    transport_cancel.cancel();
    if let Err(e) = transport_task.await {
        error!("MQTT event loop task failed: {}", e);
    }

    info!("{}", service.metrics().report());
    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "zephy-ingest",
            "--registry",
            "registry.toml",
            "--port",
            "9200",
        ])
        .unwrap();
        assert_eq!(args.port, 9200);
        assert_eq!(args.readings, PathBuf::from("readings.jsonl"));
        assert!(args.config.is_none());

        assert!(Args::try_parse_from(["zephy-ingest"]).is_err());
    }

    #[test]
    fn test_load_config_requires_broker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zephy.toml");
        std::fs::write(&path, "[broker]\nurl = \"\"\n").unwrap();

        let args = Args::try_parse_from([
            "zephy-ingest",
            "--registry",
            "registry.toml",
            "--config",
            path.to_str().unwrap(),
        ])
        .unwrap();
        // Fails unless the environment supplies a complete broker config
        if std::env::var("MQTT_BROKER_URL").is_err() {
            assert!(matches!(load_config(&args), Err(IngestError::Config(_))));
        }
    }
}
