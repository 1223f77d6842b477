use std::path::PathBuf;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::health::{HealthReporter, HealthStatus};
use turnstile::ratelimit::PolicyRegistry;

/// In-process admission control service.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Turnstile admission control");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = TurnstileConfig::load(args.config.as_deref())?;
    info!(
        sweep_interval_secs = config.store.sweep_interval_secs,
        degraded_threshold = config.health.degraded_threshold,
        overrides = config.policies.len(),
        "Configuration loaded"
    );

    let registry = PolicyRegistry::with_overrides(&config.policies)?;
    registry.start_sweepers(config.store.sweep_interval());

    let reporter = HealthReporter::new(config.health.degraded_threshold);
    let mut ticker = tokio::time::interval(config.health.report_interval());

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = reporter.report(&registry);
                if report.status == HealthStatus::Healthy {
                    info!(
                        total_keys = report.stats.total_keys,
                        total_requests = report.stats.total_requests,
                        "Admission health"
                    );
                }
            }
            _ = &mut shutdown => break,
        }
    }

    registry.shutdown();
    info!("Turnstile stopped");
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
