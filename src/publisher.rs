//! C7: publishes decoded readings and slot-state events to MQTT, with a
//! once-a-minute heartbeat carrying liveness and counters (spec §4.6, §6).

use std::time::{Duration, Instant};

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::MqttConfig;
use crate::decoder::SensorReading;
use crate::error::PublishError;
use crate::monitor::{SharedState, TelemetryEvent};

const HEARTBEAT_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
struct StatusPayload {
    connected: bool,
    uptime: u64,
}

#[derive(Debug, Serialize)]
struct NetworkStatsPayload {
    frames_received: u64,
    frames_rejected: std::collections::HashMap<String, u64>,
    bytes_in: u64,
    last_seen_age_s: Option<u64>,
}

#[derive(Debug, Serialize)]
struct StatsPayload {
    networks: std::collections::HashMap<String, NetworkStatsPayload>,
}

fn channel_topic(prefix: &str, channel_slot: Option<u8>) -> Option<String> {
    channel_slot.map(|n| format!("{prefix}/channel{n:02}"))
}

fn network_channel_topic(prefix: &str, network_id: &str, channel_slot: Option<u8>) -> Option<String> {
    channel_slot.map(|n| format!("{prefix}/network/{network_id}/channel_{n}"))
}

/// Publishes to both the plain and per-network topics. Both are always
/// attempted; a dropped publish (typical while disconnected) doesn't stop
/// the other one, but is still surfaced as a [`PublishError`] to the caller
/// so `run_publisher` can log it at the component boundary (spec §7).
async fn publish_reading(client: &AsyncClient, prefix: &str, reading: &SensorReading) -> Result<(), PublishError> {
    let payload = serde_json::to_vec(reading)?;
    let mut result = Ok(());
    if let Some(topic) = channel_topic(prefix, reading.channel_slot) {
        if let Err(e) = client.publish(&topic, QoS::AtMostOnce, false, payload.clone()).await {
            result = Err(PublishError::from(e));
        }
    }
    if let Some(topic) = network_channel_topic(prefix, &reading.network_id, reading.channel_slot) {
        if let Err(e) = client.publish(&topic, QoS::AtMostOnce, false, payload).await {
            result = Err(PublishError::from(e));
        }
    }
    result
}

/// Publishes `<prefix>/monitor/status` and `<prefix>/monitor/stats`. Called
/// both on the 60 s heartbeat tick and immediately on every connect/disconnect
/// transition (spec §4.6 "60 s and on connect/disconnect").
async fn publish_heartbeat(
    client: &AsyncClient,
    prefix: &str,
    state: &SharedState,
    connected: bool,
    started_at: Instant,
) -> Result<(), PublishError> {
    let status = StatusPayload {
        connected,
        uptime: started_at.elapsed().as_secs(),
    };
    let payload = serde_json::to_vec(&status)?;
    client
        .publish(format!("{prefix}/monitor/status"), QoS::AtMostOnce, false, payload)
        .await?;

    let guard = state.read().await;
    let networks = guard
        .iter()
        .map(|(id, ns)| {
            (
                id.clone(),
                NetworkStatsPayload {
                    frames_received: ns.counters.frames_received,
                    frames_rejected: ns.counters.frames_rejected.clone(),
                    bytes_in: ns.counters.bytes_in,
                    last_seen_age_s: ns.counters.last_seen.map(|t| t.elapsed().as_secs()),
                },
            )
        })
        .collect();
    drop(guard);

    let payload = serde_json::to_vec(&StatsPayload { networks })?;
    client
        .publish(format!("{prefix}/monitor/stats"), QoS::AtMostOnce, false, payload)
        .await?;
    Ok(())
}

/// Drives the MQTT event loop, publishing connected state transitions on
/// `connected` so `run_publisher` can react to them immediately. rumqttc
/// reconnects internally on the next `poll()` after a disconnect; this loop
/// only needs to keep polling and record what it observes.
async fn drive_event_loop(mut eventloop: rumqttc::EventLoop, connected: watch::Sender<bool>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if !*connected.borrow() {
                    let _ = connected.send(true);
                    info!("mqtt connected");
                }
            }
            Ok(_) => {}
            Err(e) => {
                if *connected.borrow() {
                    let _ = connected.send(false);
                    warn!(error = %e, "mqtt disconnected, reconnecting");
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
}

/// Runs the publisher until `shutdown` fires. Owns the only MQTT writer in
/// the process (spec §5 "MQTT client: single writer").
pub async fn run_publisher(
    config: MqttConfig,
    client_id: String,
    state: SharedState,
    mut rx: mpsc::Receiver<TelemetryEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut options = MqttOptions::new(client_id, config.broker.clone(), config.port);
    options.set_keep_alive(Duration::from_secs(30));
    if let (Some(user), Some(pass)) = (config.username.as_ref(), config.password.as_ref()) {
        options.set_credentials(user, pass);
    }
    if config.use_tls {
        options.set_transport(Transport::tls_with_default_config());
    }

    let (client, eventloop) = AsyncClient::new(options, 64);
    let (connected_tx, mut connected_rx) = watch::channel(false);
    let driver = tokio::spawn(drive_event_loop(eventloop, connected_tx));

    let started_at = Instant::now();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_PERIOD);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                let is_connected = *connected_rx.borrow();
                if let Err(e) = publish_heartbeat(&client, &config.topic_prefix, &state, is_connected, started_at).await {
                    warn!(error = %e, "heartbeat publish failed");
                }
            }
            _ = connected_rx.changed() => {
                let is_connected = *connected_rx.borrow();
                if let Err(e) = publish_heartbeat(&client, &config.topic_prefix, &state, is_connected, started_at).await {
                    warn!(error = %e, "connect/disconnect status publish failed");
                }
            }
            event = rx.recv() => {
                match event {
                    Some(TelemetryEvent::Reading(reading)) => {
                        if let Err(e) = publish_reading(&client, &config.topic_prefix, &reading).await {
                            debug!(error = %e, "reading publish dropped");
                        }
                    }
                    Some(TelemetryEvent::SlotScan(snapshot)) => {
                        if let Ok(payload) = serde_json::to_vec(&snapshot) {
                            let topic = format!("{}/monitor/slots", config.topic_prefix);
                            let _ = client.publish(topic, QoS::AtMostOnce, false, payload).await;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    driver.abort();
}
