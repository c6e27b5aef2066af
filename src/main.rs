//! Rota Transport Probe - Entry Point
//!
//! Runs one fingerprint round over the proxies listed in `ROTA_PROXIES_FILE`
//! and prints one JSON line per proxy.

use std::path::Path;

use anyhow::Context;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rota_transport::config::LogConfig;
use rota_transport::models::ProxyToRefresh;
use rota_transport::proxy::{FingerprintChecker, FingerprintCheckerConfig, TransportRegistry};
use rota_transport::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config.log);

    info!("Starting Rota transport probe");

    let registry = TransportRegistry::with_defaults(&config.providers)?;
    info!("Registered transports: {}", registry.types().join(", "));

    let Some(path) = config.fingerprint.proxies_file.as_deref() else {
        warn!("ROTA_PROXIES_FILE is not set, nothing to probe");
        return Ok(());
    };

    let proxies = load_proxies(path).await?;
    info!("Loaded {} proxies from {}", proxies.len(), path.display());

    let checker = FingerprintChecker::new(
        registry,
        FingerprintCheckerConfig::from(&config.fingerprint)
            .with_connect_timeout(config.transport.connect_timeout()),
    );

    let results = tokio::select! {
        results = checker.check_all(proxies) => results,
        _ = shutdown_signal() => {
            info!(
                "Shutdown signal received, abandoning {} sockets",
                checker.sockets().len()
            );
            return Ok(());
        }
    };

    for result in &results {
        println!("{}", serde_json::to_string(result)?);
    }

    let healthy = results.iter().filter(|r| r.success).count();
    info!(
        "Probe complete: {} healthy, {} unhealthy",
        healthy,
        results.len() - healthy
    );

    Ok(())
}

/// Logs go to stderr so stdout only carries results
fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("rota_transport={}", log.level).into());
    let registry = tracing_subscriber::registry().with(filter);

    if log.format.eq_ignore_ascii_case("pretty") {
        registry
            .with(fmt::layer().pretty().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    }
}

async fn load_proxies(path: &Path) -> anyhow::Result<Vec<ProxyToRefresh>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;

    serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a JSON list of proxies", path.display()))
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
