//! MCP Host Entry Point
//!
//! Initializes logging, loads configuration and runs the embedded MCP host
//! until Ctrl-C.

use std::fs::OpenOptions;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{Level, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use host_mcp_server::core::config::LoggingConfig;
use host_mcp_server::core::{Config, McpHost};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration from environment
    let config = Config::from_env();

    init_logging(&config.logging)?;

    info!("Starting {} v{}", config.server.name, config.server.version);
    info!("Transport: {}", config.transport.description());

    let cancellation = CancellationToken::new();
    let host = McpHost::start(config, cancellation.clone()).await?;
    info!("MCP endpoint: {}", host.endpoint_url());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    host.stop().await?;
    info!("Server shutting down");

    Ok(())
}

/// Initialize the logging subsystem.
///
/// Logs go to stderr and, when a log directory is configured, are appended
/// to `<directory>/<file_name>` without ANSI colors.
fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let level = match logging.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr);

    let file_layer = match &logging.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("cannot create log directory {}", dir.display()))?;
            let path = dir.join(&logging.file_name);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(true)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Ok(())
}
