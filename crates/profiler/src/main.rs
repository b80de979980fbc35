//! Process Profiler - per-process CPU, GPU and memory sampling
//!
//! This binary follows every process with the configured name, records
//! per-process and aggregate samples into a bounded history and serves
//! health and Prometheus endpoints.

use anyhow::{Context, Result};
use profiler_lib::{health::HealthRegistry, MetricKind, Profiler};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting process-profiler");

    let config = config::ProfilerConfig::load()?;
    info!(
        target_name = %config.target,
        history_capacity = config.history_capacity,
        gpu_enabled = config.gpu_enabled,
        persist = config.persist,
        "Profiler configured"
    );

    let health_registry = HealthRegistry::new();

    let mut builder = Profiler::builder()
        .capture_config(config.capture_config())
        .history_capacity(config.history_capacity)
        .gpu_enabled(config.gpu_enabled)
        .label_criteria(config.label_criteria())
        .health(health_registry.clone());
    for kind in MetricKind::ALL {
        builder = builder.sampler_config(kind, config.sampler_config(kind));
    }

    let profiler = builder.build().context("Failed to assemble profiler")?;
    let running = match profiler.start().await {
        Ok(running) => running,
        Err(e) => {
            error!(target_name = %config.target, error = %e, "Profiler failed to start");
            return Err(e).context("Failed to start profiler");
        }
    };

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        running.handle(),
    ));

    // Mark ready once every loop is running
    health_registry.set_ready(true).await;

    // Start health and metrics server
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    health_registry.set_ready(false).await;
    running.shutdown("SIGINT received").await;
    api_handle.abort();
    info!("Shutdown complete");

    Ok(())
}
