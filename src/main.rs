use async_trait::async_trait;
use clap::Parser;
use plugin_resilience::recovery::{
    HealthCheckResult, HealthChecker, HealthStatus, UnitController,
};
use plugin_resilience::{PluginError, ResilienceConfig, ResilienceEngine, Scope};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "plugin-resilience", version, about = "Resilience control plane for plugin hosts")]
struct Args {
    /// Path to a resilience configuration file (toml)
    #[arg(short, long, env = "CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "plugin_resilience=info")]
    log_filter: String,
}

/// Controller that only records requested actions.
///
/// A real embedding wires the host's plugin manager here; the standalone
/// binary runs the control plane against this stand-in.
struct LogOnlyController;

#[async_trait]
impl UnitController for LogOnlyController {
    async fn restart(&self, unit_id: &str) -> Result<(), PluginError> {
        tracing::info!(unit_id = %unit_id, "Restart requested");
        Ok(())
    }

    async fn reload(&self, unit_id: &str) -> Result<(), PluginError> {
        tracing::info!(unit_id = %unit_id, "Reload requested");
        Ok(())
    }

    async fn reset(&self, unit_id: &str) -> Result<(), PluginError> {
        tracing::info!(unit_id = %unit_id, "Reset requested");
        Ok(())
    }

    async fn failover(&self, unit_id: &str, target: &str) -> Result<(), PluginError> {
        tracing::info!(unit_id = %unit_id, target = %target, "Failover requested");
        Ok(())
    }
}

/// Checker that reports every registered unit healthy
struct StaticHealthChecker;

#[async_trait]
impl HealthChecker for StaticHealthChecker {
    async fn check(&self, _scope: &Scope, unit_id: &str) -> Result<HealthCheckResult, PluginError> {
        let start = Instant::now();
        Ok(HealthCheckResult {
            unit_id: unit_id.to_string(),
            status: HealthStatus::Healthy,
            message: "static check".to_string(),
            checked_at: chrono::Utc::now(),
            latency: start.elapsed(),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_filter.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting plugin-resilience v{}", env!("CARGO_PKG_VERSION"));

    plugin_resilience::circuit_breaker::init_circuit_breaker_metrics(prometheus::default_registry())?;

    let config = ResilienceConfig::load(args.config.as_deref())?;
    tracing::info!(
        circuit_breakers = config.circuit_breakers.len(),
        retry_policies = config.retry_policies.len(),
        fallbacks = config.fallbacks.len(),
        policies = config.policies.len(),
        "Configuration loaded"
    );

    let engine = ResilienceEngine::builder(
        config,
        Arc::new(LogOnlyController),
        Arc::new(StaticHealthChecker),
    )
    .build()?;

    engine.start()?;
    tracing::info!("Resilience engine running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    engine.shutdown().await?;
    tracing::info!("Goodbye");
    Ok(())
}
