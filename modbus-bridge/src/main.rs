//! Modbus register bridge.
//!
//! Starts the configured server endpoints and bridge blocks, then runs
//! until Ctrl+C. Shutdown stops workers, closes clients, then stops
//! (and optionally persists) the server endpoints.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use modbus_bridge::config::ModbusBridgeConfig;
use modbus_bridge::server::ServerBridge;
use modbus_bridge::supervisor::BridgeSupervisor;
use modbus_bridge::transport::ModbusConnector;
use modbus_bridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Interval between status log lines.
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let args = BridgeArgs::parse_with_default("modbus-bridge.json5");

    let config = ModbusBridgeConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    let mut runner = BridgeRunner::new("modbus-bridge", config, Some(&args))?;
    info!("Loaded configuration from {:?}", args.config);

    // Servers first so bridge blocks may target them
    let server = match &runner.config().servers {
        Some(settings) => Some(
            ServerBridge::start(settings)
                .await
                .context("Failed to start server endpoints")?,
        ),
        None => None,
    };

    let mut supervisor = BridgeSupervisor::new(Arc::new(ModbusConnector));
    if let Some(settings) = &runner.config().bridge {
        if let Err(e) = supervisor.reconfigure(settings).await {
            stop_server(server).await;
            return Err(e).context("Failed to configure bridge");
        }
    }

    let supervisor = Arc::new(Mutex::new(supervisor));
    let status = supervisor.clone();
    runner.spawn(async move {
        let mut ticker = tokio::time::interval(STATUS_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let readings = status.lock().await.readings();
            let failing = readings
                .blocks
                .iter()
                .filter(|b| b.consecutive_failures > 0)
                .count();
            info!(
                endpoints = readings.active_endpoints,
                blocks = readings.blocks.len(),
                failing,
                "Bridge status"
            );
            for block in readings.blocks.iter().filter(|b| b.consecutive_failures > 0) {
                debug!(
                    block = %block.block,
                    failures = block.consecutive_failures,
                    error = block.last_error.as_deref().unwrap_or(""),
                    "Block failing"
                );
            }
        }
    });

    runner
        .run(|| async move {
            supervisor.lock().await.shutdown().await;
            stop_server(server).await;
        })
        .await?;

    Ok(())
}

async fn stop_server(server: Option<ServerBridge>) {
    if let Some(server) = server {
        if let Err(e) = server.stop().await {
            error!(error = %e, "Failed to stop server endpoints");
        }
    }
}
