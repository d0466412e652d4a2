use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use quotagate::config::QuotaGateConfig;
use quotagate::http::{Gate, HttpServer};
use quotagate::ratelimit::RateLimiter;

/// Log output format.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Distributed admission control service.
#[derive(Debug, Parser)]
#[command(name = "quotagate", version, about)]
struct Args {
    /// Configuration file (YAML, TOML or JSON); QUOTAGATE__* variables override it
    #[arg(short, long, env = "QUOTAGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match args.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .init(),
    }

    info!("Starting Quotagate admission service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = QuotaGateConfig::load(args.config.as_deref())?;
    info!(
        listen_addr = %config.server.listen_addr,
        enabled = config.rate_limit.enabled,
        strategy = %config.rate_limit.strategy,
        "Configuration loaded"
    );

    // One limiter (and one store connection) for the whole process
    let rate_limiter = Arc::new(RateLimiter::connect(config.rate_limit.clone()).await?);

    let gate = Gate::new(rate_limiter.clone(), config.server.trust_forwarded_for)
        .with_principal_headers(config.server.trust_principal_headers);
    let server = HttpServer::new(config.server.listen_addr, gate);

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    rate_limiter.close().await;
    info!("Quotagate admission service stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
