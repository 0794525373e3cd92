//! Composition root for the gateway core. `main.rs` is the thin external
//! wrapper (config file loading, logging init); everything here is the
//! thing spec §2's component table describes, wired per §5's concurrency
//! contract.

pub mod config;
pub mod decoder;
pub mod error;
pub mod modbus;
pub mod monitor;
pub mod publisher;
pub mod reassembler;
pub mod serial;
pub mod slots;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, RwLock};
use tracing::info;

use config::GatewayConfig;
use monitor::SharedState;

const TELEMETRY_CHANNEL_CAPACITY: usize = 256;

/// Runs the gateway until either the configured `duration_hours` elapses
/// or the process receives a shutdown request (ctrl-c). Returns once every
/// task has finished its in-flight operation and exited (spec §5
/// "Cancellation").
pub async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    config.validate()?;

    let shared_state: SharedState = Arc::new(RwLock::new(HashMap::new()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (telemetry_tx, telemetry_rx) = mpsc::channel(TELEMETRY_CHANNEL_CAPACITY);

    let modbus_port = serial::open(&config.modbus.port, config.modbus.baud)?;
    let modbus = modbus::spawn_modbus_actor(modbus_port, config.modbus.slave_id, modbus::default_timeout());

    let mut tasks = Vec::new();

    for network in config.networks.clone() {
        let state = shared_state.clone();
        let tx = telemetry_tx.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(monitor::run_network_supervisor(network, state, tx, shutdown)));
    }

    tasks.push(tokio::spawn(monitor::run_modbus_cross_check(
        modbus.clone(),
        Duration::from_secs(config.modbus.scan_period_s as u64),
        telemetry_tx.clone(),
        shutdown_rx.clone(),
    )));

    let client_id = format!("{}-gateway", config.mqtt.topic_prefix);
    tasks.push(tokio::spawn(publisher::run_publisher(
        config.mqtt.clone(),
        client_id,
        shared_state.clone(),
        telemetry_rx,
        shutdown_rx.clone(),
    )));

    drop(telemetry_tx);

    match config.duration_hours {
        Some(hours) => {
            let bound = Duration::from_secs(hours as u64 * 3600);
            info!(hours, "gateway running with a bounded duration");
            tokio::select! {
                _ = tokio::time::sleep(bound) => {
                    info!("configured duration elapsed, shutting down");
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown requested");
                }
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            info!("shutdown requested");
        }
    }

    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}
