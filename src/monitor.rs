//! C6: one independent ingestion pipeline per configured network, merged
//! into shared per-network state and handed off to the publisher (spec
//! §4.5). Also hosts the periodic Modbus cross-check scan.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::NetworkConfig;
use crate::decoder::{self, NetworkId, SensorReading};
use crate::error::{DecodeError, FramingError};
use crate::modbus::ModbusHandle;
use crate::reassembler::{FrameReassembler, ReassemblerEvent};
use crate::serial;
use crate::slots::{self, ChannelSlot};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Rolling counters for one network (spec §3 `NetworkState`).
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct NetworkCounters {
    pub frames_received: u64,
    pub frames_rejected: HashMap<String, u64>,
    pub bytes_in: u64,
    #[serde(skip)]
    pub last_seen: Option<std::time::Instant>,
}

/// Most recent reading per `(transmitter_address, channel_slot)` plus
/// rolling counters, keyed by `network_id` in [`SharedState`].
#[derive(Debug, Default)]
pub struct NetworkState {
    pub counters: NetworkCounters,
    pub last_readings: HashMap<(u16, Option<u8>), SensorReading>,
}

pub type SharedState = Arc<RwLock<HashMap<NetworkId, NetworkState>>>;

/// Events C6 hands to C7. One stream shared by every network's monitor
/// task and the periodic Modbus cross-check.
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    Reading(SensorReading),
    SlotScan(Vec<SlotSnapshot>),
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SlotSnapshot {
    pub slot_index: u8,
    pub radio_address: u16,
    pub classification: &'static str,
}

fn snapshot(slots: &[ChannelSlot]) -> Vec<SlotSnapshot> {
    slots
        .iter()
        .map(|s| SlotSnapshot {
            slot_index: s.slot_index,
            radio_address: s.radio_address,
            classification: match s.classification() {
                slots::Classification::Unused => "unused",
                slots::Classification::Active => "active",
                slots::Classification::Inactive => "inactive",
            },
        })
        .collect()
}

async fn record_rejected(state: &SharedState, network_id: &str, reason: &str) {
    debug!(network = network_id, reason, "frame rejected");
    let mut guard = state.write().await;
    let entry = guard.entry(network_id.to_string()).or_default();
    *entry.counters.frames_rejected.entry(reason.to_string()).or_insert(0) += 1;
}

/// Opens the port, feeds every byte read through the reassembler and
/// decoder, and updates shared state — runs until the port errors or
/// `shutdown` fires. The caller (the supervisor loop) is responsible for
/// restart/backoff; this function returns once on any terminal I/O error.
async fn run_pipeline_once(
    network: &NetworkConfig,
    state: &SharedState,
    tx: &mpsc::Sender<TelemetryEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> std::io::Result<()> {
    let mut port = serial::open(&network.port, network.baud)?;
    let mut reassembler = FrameReassembler::new();
    let mut buf = [0u8; 512];

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    reassembler.reset();
                    return Ok(());
                }
            }
            read = port.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                {
                    let mut guard = state.write().await;
                    let entry = guard.entry(network.id.clone()).or_default();
                    entry.counters.bytes_in += n as u64;
                }
                for event in reassembler.feed(&buf[..n]) {
                    match event {
                        ReassemblerEvent::Error(FramingError::ZeroLength) => {
                            record_rejected(state, &network.id, "zero_length").await;
                        }
                        ReassemblerEvent::Error(FramingError::NoSync { .. }) => {
                            record_rejected(state, &network.id, "no_sync").await;
                        }
                        ReassemblerEvent::Frame(frame) => {
                            match decoder::decode(&frame, &network.id) {
                                Ok(reading) => {
                                    let mut guard = state.write().await;
                                    let entry = guard.entry(network.id.clone()).or_default();
                                    entry.counters.frames_received += 1;
                                    entry.counters.last_seen = Some(std::time::Instant::now());
                                    entry
                                        .last_readings
                                        .insert((reading.transmitter_address.0, reading.channel_slot), reading.clone());
                                    drop(guard);
                                    if tx.send(TelemetryEvent::Reading(reading)).await.is_err() {
                                        warn!(network = %network.id, "publisher channel closed");
                                        return Ok(());
                                    }
                                }
                                Err(e) => {
                                    let reason = decode_error_reason(&e);
                                    record_rejected(state, &network.id, reason).await;
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

fn decode_error_reason(err: &DecodeError) -> &'static str {
    match err {
        DecodeError::Truncated { .. } => "truncated",
        DecodeError::UnsupportedProtocol(_) => "unsupported_protocol",
        DecodeError::ChecksumError { .. } => "checksum_error",
        DecodeError::InvalidChannelSlot(_) => "invalid_channel_slot",
    }
}

/// Supervises one network's pipeline: restarts it with exponential backoff
/// on any port error (spec §4.5). Exits only when `shutdown` fires.
pub async fn run_network_supervisor(
    network: NetworkConfig,
    state: SharedState,
    tx: mpsc::Sender<TelemetryEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if *shutdown.borrow() {
            return;
        }
        match run_pipeline_once(&network, &state, &tx, &mut shutdown).await {
            Ok(()) => {
                if *shutdown.borrow() {
                    return;
                }
                backoff = INITIAL_BACKOFF;
            }
            Err(e) => {
                error!(network = %network.id, error = %e, backoff_ms = backoff.as_millis(), "network pipeline failed, retrying");
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
        tokio::select! {
            _ = sleep(backoff) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// Periodic Modbus cross-check (spec §4.5 "Cross-checking") plus the C5
/// maintenance pass (spec §4.4): scans all 32 slots on `period`, diffs
/// against the previous scan, runs disable-stale/scan/auto-assign over
/// that same scan, and forwards a snapshot to the publisher regardless of
/// whether anything changed.
pub async fn run_modbus_cross_check(
    modbus: ModbusHandle,
    period: Duration,
    tx: mpsc::Sender<TelemetryEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last: Option<Vec<SlotSnapshot>> = None;
    loop {
        tokio::select! {
            _ = sleep(period) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
        if *shutdown.borrow() {
            return;
        }
        match slots::scan_all(&modbus).await {
            Ok(slots) => {
                match slots::run_maintenance_cycle(&modbus, &slots).await {
                    Ok(report) => {
                        if !report.disabled.is_empty() || !report.assigned.is_empty() {
                            info!(
                                disabled = ?report.disabled,
                                scan_slot = report.scan_slot,
                                rogues_seen = ?report.rogues_seen,
                                assigned = ?report.assigned,
                                "slot maintenance cycle made changes"
                            );
                        }
                    }
                    Err(e) => warn!(error = %e, "slot maintenance cycle failed"),
                }

                let snap = snapshot(&slots);
                if last.as_ref() != Some(&snap) {
                    info!("slot state changed");
                }
                last = Some(snap.clone());
                if tx.send(TelemetryEvent::SlotScan(snap)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "modbus cross-check scan failed");
            }
        }
    }
}

impl PartialEq for SlotSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.slot_index == other.slot_index
            && self.radio_address == other.radio_address
            && self.classification == other.classification
    }
}
