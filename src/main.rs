//! sera-agent: greenhouse control-loop daemon.
//!
//! Reads sensor floats from a Siemens S7 PLC, asks a remote decision service
//! what to do, applies the vetted changes to the actuator outputs and writes
//! status text back for the HMI, on a fixed cadence until shutdown.

mod config;
mod decision;
mod equipment;
mod error;
mod fieldbus;
mod models;
mod orchestrator;
mod s7;
mod status;
mod tracker;

use std::path::PathBuf;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::AgentConfig;
use crate::decision::DecisionClient;
use crate::fieldbus::PlcConnection;
use crate::orchestrator::ControlLoop;
use crate::s7::TcpTransport;
use crate::tracker::EquipmentTracker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional; a missing file is not an error.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sera_agent=info")),
        )
        .init();

    let config_path = std::env::var("SERA_AGENT_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(config::DEFAULT_CONFIG_PATH));
    let config = AgentConfig::load(&config_path)?;
    info!(config = %config_path.display(), plc = %config.plc.ip_address, "sera-agent starting");

    let transport = TcpTransport::new(&config.plc.ip_address, config.plc.rack, config.plc.slot);
    let mut plc = PlcConnection::new(transport);
    plc.connect()
        .await
        .with_context(|| format!("connecting to PLC at {}", config.plc.ip_address))?;

    let decisions = DecisionClient::new(config.decision_settings())
        .context("building decision service client")?;
    let tracker = EquipmentTracker::new(config.dwell(), config.control.interlocks.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received"),
            Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
        }
        let _ = shutdown_tx.send(true);
    });

    let mut control = ControlLoop::new(
        plc,
        decisions,
        tracker,
        config.interval(),
        shutdown_rx,
    );
    control.run().await;

    info!("sera-agent stopped");
    Ok(())
}
