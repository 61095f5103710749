//! # hyperf
//!
//! Event-routing server binary: loads config, registers controllers and
//! serves the WebSocket transport until interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use hyperf_server::{ControllerRegistry, ServerConfig, UserController};
use hyperf_telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use tracing::Level;

/// hyperf event-routing server.
#[derive(Parser, Debug)]
#[command(name = "hyperf", about = "Declarative event routing over WebSocket")]
struct Cli {
    /// Host to bind (overrides config and HYPERF_HOST).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides config and HYPERF_PORT).
    #[arg(long)]
    port: Option<u16>,

    /// JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Default log level. RUST_LOG takes precedence.
    #[arg(long, default_value = "info")]
    log_level: Level,

    /// Log output format: pretty or json.
    #[arg(long, default_value = "pretty")]
    log_format: LogFormat,
}

impl Cli {
    fn server_config(&self) -> Result<ServerConfig> {
        let mut config = ServerConfig::load(self.config.as_deref())
            .context("Failed to load server config")?;
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        Ok(config)
    }
}

fn build_registry() -> Result<ControllerRegistry> {
    let mut registry = ControllerRegistry::new();
    registry
        .register(Arc::new(UserController::new()))
        .context("Failed to register controller")?;
    Ok(registry)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let telemetry = init_telemetry(TelemetryConfig {
        log_level: cli.log_level,
        format: cli.log_format,
        ..Default::default()
    });

    let result = run(&cli, &telemetry).await;
    if let Err(e) = &result {
        tracing::error!(error = format!("{e:#}"), "hyperf failed to start");
    }
    result
}

async fn run(cli: &Cli, telemetry: &hyperf_telemetry::TelemetryGuard) -> Result<()> {
    let config = cli.server_config()?;
    let registry = build_registry()?;

    let handle = hyperf_server::start(config, registry, telemetry.metrics())
        .await
        .context("Failed to start server")?;
    tracing::info!(port = handle.port, "hyperf server ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
