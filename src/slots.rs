//! C4 (slot-state model) and C5 (slot manager procedures): the 32-slot view
//! of the controller and the scan/disable/rogue-discovery workflow that
//! keeps it in sync with what's actually transmitting (spec §4.4).

use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info};

use crate::decoder::{GasType, SensorMode, SensorType};
use crate::error::{ModbusError, SlotManagerError};
use crate::modbus::{
    battery_addr, gas_type_addr, mode_addr, radio_address_addr, reading_addr, sensor_type_addr,
    time_since_addr, ModbusHandle,
};

pub const SLOT_COUNT: u8 = 32;
const ACTIVE_THRESHOLD_S: u16 = 600;
/// A transmitter is "seen" on the scan slot within this window (spec §4.4.4).
const ROGUE_SEEN_THRESHOLD_S: u16 = 5;
/// Reserved broadcast address; never a real binding.
const BROADCAST_ADDRESS: u16 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Unused,
    Active,
    Inactive,
}

/// Pure function of the two registers that define it (spec §3 invariant:
/// "the manager never writes classification, only the inputs").
pub fn classify(radio_address: u16, time_since_last_message: u16) -> Classification {
    if radio_address == 0 {
        Classification::Unused
    } else if time_since_last_message < ACTIVE_THRESHOLD_S {
        Classification::Active
    } else {
        Classification::Inactive
    }
}

/// Controller-side state for slot `i ∈ 1..32` (spec §3).
#[derive(Debug, Clone)]
pub struct ChannelSlot {
    pub slot_index: u8,
    pub radio_address: u16,
    pub time_since_last_message: u16,
    pub mode: SensorMode,
    pub sensor_type: SensorType,
    pub gas_type: GasType,
    pub last_reading: f32,
    pub battery_voltage: f32,
}

impl ChannelSlot {
    pub fn classification(&self) -> Classification {
        classify(self.radio_address, self.time_since_last_message)
    }
}

/// Issues the minimum number of reads to populate one slot's record
/// (spec §4.3 `read_slot`).
pub async fn read_slot(modbus: &ModbusHandle, i: u8) -> Result<ChannelSlot, ModbusError> {
    let radio_address = modbus.read_u16(radio_address_addr(i)).await?;
    let time_since_last_message = modbus.read_u16(time_since_addr(i)).await?;
    let mode = modbus.read_u16(mode_addr(i)).await?;
    let sensor_type = modbus.read_u16(sensor_type_addr(i)).await?;
    let gas_type = modbus.read_u16(gas_type_addr(i)).await?;
    let last_reading = modbus.read_f32(reading_addr(i)).await?;
    let battery_voltage = modbus.read_f32(battery_addr(i)).await?;

    Ok(ChannelSlot {
        slot_index: i,
        radio_address,
        time_since_last_message,
        mode: SensorMode::from_raw(mode as u8),
        sensor_type: SensorType::from_raw(sensor_type as u8),
        gas_type: GasType::from_raw(gas_type as u8),
        last_reading,
        battery_voltage,
    })
}

/// Batched scan of all 32 slots with a small inter-request pause, enough
/// for device turnaround at 9600 baud (spec §4.3 `scan_all`).
pub async fn scan_all(modbus: &ModbusHandle) -> Result<Vec<ChannelSlot>, ModbusError> {
    let mut slots = Vec::with_capacity(SLOT_COUNT as usize);
    for i in 1..=SLOT_COUNT {
        slots.push(read_slot(modbus, i).await?);
        sleep(crate::modbus::SCAN_INTER_REQUEST_PAUSE).await;
    }
    Ok(slots)
}

/// Partition of a scan by classification (spec §8 S4).
#[derive(Debug, Default)]
pub struct ScanPartition {
    pub active: Vec<u8>,
    pub inactive: Vec<u8>,
    pub unused: Vec<u8>,
}

pub fn partition(slots: &[ChannelSlot]) -> ScanPartition {
    let mut p = ScanPartition::default();
    for slot in slots {
        match slot.classification() {
            Classification::Active => p.active.push(slot.slot_index),
            Classification::Inactive => p.inactive.push(slot.slot_index),
            Classification::Unused => p.unused.push(slot.slot_index),
        }
    }
    p
}

/// Write 0 to every Inactive slot's radio_address register; the slot
/// transitions to Unused at the manager's next scan (spec §4.4.2).
pub async fn disable_stale(modbus: &ModbusHandle, slots: &[ChannelSlot]) -> Result<Vec<u8>, ModbusError> {
    let mut disabled = Vec::new();
    for slot in slots {
        if slot.classification() == Classification::Inactive {
            modbus.write_single_register(radio_address_addr(slot.slot_index), 0).await?;
            info!(slot = slot.slot_index, "disabled stale slot");
            disabled.push(slot.slot_index);
        }
    }
    Ok(disabled)
}

/// Choose the lowest-numbered Unused slot and bind it to the broadcast
/// address so it hears any unbound transmitter (spec §4.4.3).
pub async fn setup_scan_slot(modbus: &ModbusHandle, slots: &[ChannelSlot]) -> Result<u8, SlotManagerError> {
    let lowest_unused = slots
        .iter()
        .filter(|s| s.classification() == Classification::Unused)
        .map(|s| s.slot_index)
        .min()
        .ok_or(SlotManagerError::NoCapacity(BROADCAST_ADDRESS))?;

    if modbus
        .write_single_register(radio_address_addr(lowest_unused), BROADCAST_ADDRESS)
        .await
        .is_err()
    {
        // A transient Modbus failure here is the caller's to retry; the
        // manager has no state to roll back since nothing was written.
        return Err(SlotManagerError::NoCapacity(BROADCAST_ADDRESS));
    }
    info!(slot = lowest_unused, "opened scan slot");
    Ok(lowest_unused)
}

/// Poll the scan slot on a short cycle for a bounded duration, collecting
/// every distinct address seen transmitting within the threshold window
/// (spec §4.4.4).
pub async fn monitor_for_rogues(
    modbus: &ModbusHandle,
    scan_slot: u8,
    duration: Duration,
    poll_interval: Duration,
) -> Result<Vec<u16>, ModbusError> {
    let mut seen = std::collections::HashSet::new();
    let deadline = tokio::time::Instant::now() + duration;
    while tokio::time::Instant::now() < deadline {
        let address = modbus.read_u16(radio_address_addr(scan_slot)).await?;
        let time_since = modbus.read_u16(time_since_addr(scan_slot)).await?;
        if address != 0 && address != BROADCAST_ADDRESS && time_since < ROGUE_SEEN_THRESHOLD_S {
            debug!(address, "rogue transmitter seen on scan slot");
            seen.insert(address);
        }
        sleep(poll_interval).await;
    }
    Ok(seen.into_iter().collect())
}

/// For each discovered rogue, bind it into the lowest remaining Unused
/// slot (excluding the scan slot itself). Returns one outcome per input
/// address (spec §4.4.5 and its edge cases).
pub async fn auto_assign_rogue(
    modbus: &ModbusHandle,
    rogues: &[u16],
    slots: &[ChannelSlot],
    scan_slot: u8,
) -> Vec<(u16, Result<u8, SlotManagerError>)> {
    let mut free: std::collections::VecDeque<u8> = slots
        .iter()
        .filter(|s| s.slot_index != scan_slot && s.classification() == Classification::Unused)
        .map(|s| s.slot_index)
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();

    let bound: std::collections::HashSet<u16> = slots
        .iter()
        .filter(|s| s.classification() != Classification::Unused)
        .map(|s| s.radio_address)
        .collect();

    let mut results = Vec::with_capacity(rogues.len());
    for &addr in rogues {
        if addr == BROADCAST_ADDRESS {
            continue; // reserved; never a real binding
        }
        if bound.contains(&addr) {
            continue; // already owns a slot, nothing to do
        }
        let Some(target) = free.pop_front() else {
            results.push((addr, Err(SlotManagerError::NoCapacity(addr))));
            continue;
        };
        match modbus.write_single_register(radio_address_addr(target), addr).await {
            Ok(()) => {
                info!(slot = target, address = addr, "auto-assigned rogue");
                results.push((addr, Ok(target)));
            }
            Err(_) => {
                free.push_front(target);
                results.push((addr, Err(SlotManagerError::NoCapacity(addr))));
            }
        }
    }
    results
}

/// How long one maintenance cycle listens on the scan slot before deciding
/// which addresses were "seen" (spec §4.4.4's "bounded duration").
const ROGUE_MONITOR_DURATION: Duration = Duration::from_secs(5);
const ROGUE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of one [`run_maintenance_cycle`] pass.
pub struct MaintenanceReport {
    pub disabled: Vec<u8>,
    pub scan_slot: u8,
    pub rogues_seen: Vec<u16>,
    pub assigned: Vec<(u16, Result<u8, SlotManagerError>)>,
}

/// One full pass of the §4.4 state machine: disable anything stale, open
/// (or reuse) a scan slot, listen for rogues, and bind whatever turns up.
/// Runs on a schedule from [`crate::monitor::run_modbus_cross_check`]; a
/// read/write failure aborts the rest of the cycle rather than leaving the
/// controller half-updated, and the next cycle just tries again.
pub async fn run_maintenance_cycle(modbus: &ModbusHandle, slots: &[ChannelSlot]) -> Result<MaintenanceReport, ModbusError> {
    let disabled = disable_stale(modbus, slots).await?;

    // Reuse an already-open scan slot rather than opening a second one.
    let existing_scan_slot = slots
        .iter()
        .find(|s| s.radio_address == BROADCAST_ADDRESS)
        .map(|s| s.slot_index);
    let scan_slot = match existing_scan_slot {
        Some(i) => i,
        None => match setup_scan_slot(modbus, slots).await {
            Ok(i) => i,
            Err(SlotManagerError::NoCapacity(_)) => {
                debug!("no unused slot available to open for scanning this cycle");
                return Ok(MaintenanceReport {
                    disabled,
                    scan_slot: 0,
                    rogues_seen: Vec::new(),
                    assigned: Vec::new(),
                });
            }
        },
    };

    let rogues_seen = monitor_for_rogues(modbus, scan_slot, ROGUE_MONITOR_DURATION, ROGUE_POLL_INTERVAL).await?;
    let assigned = auto_assign_rogue(modbus, &rogues_seen, slots, scan_slot).await;

    Ok(MaintenanceReport {
        disabled,
        scan_slot,
        rogues_seen,
        assigned,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::test_support::{build_read_response, build_write_echo, MockTransport};
    use crate::modbus::{spawn_modbus_actor, RETRY_BUDGET, WRITE_SINGLE_REGISTER};

    const SLAVE_ID: u8 = 3;

    fn slot(i: u8, radio_address: u16, time_since: u16) -> ChannelSlot {
        ChannelSlot {
            slot_index: i,
            radio_address,
            time_since_last_message: time_since,
            mode: SensorMode::Normal,
            sensor_type: SensorType::EC,
            gas_type: GasType::H2S,
            last_reading: 0.0,
            battery_voltage: 0.0,
        }
    }

    #[test]
    fn classify_partitions_the_input_space() {
        assert_eq!(classify(0, 0), Classification::Unused);
        assert_eq!(classify(0, 65535), Classification::Unused);
        assert_eq!(classify(7, 599), Classification::Active);
        assert_eq!(classify(7, 600), Classification::Inactive);
        assert_eq!(classify(7, 65535), Classification::Inactive);
    }

    #[test]
    fn partition_matches_spec_s4_scenario() {
        let mut slots: Vec<ChannelSlot> = (1..=32u8).map(|i| slot(i, 0, 65535)).collect();
        for &i in &[5u8, 6, 20] {
            slots[i as usize - 1] = slot(i, 0x1234, 10);
        }
        let p = partition(&slots);
        assert_eq!(p.active, vec![5, 6, 20]);
        assert!(p.inactive.is_empty());
        assert_eq!(p.unused.len(), 29);
    }

    #[tokio::test]
    async fn auto_assign_skips_broadcast_and_already_bound() {
        // Neither the broadcast address nor the already-bound 0x10 should
        // reach the transport at all: if they did, this empty response
        // queue would make the very first write time out.
        let transport = MockTransport::new(vec![]);
        let handle = spawn_modbus_actor(transport, SLAVE_ID, Duration::from_millis(50));
        let slots = vec![slot(1, 0x10, 10), slot(2, 0, 65535), slot(3, 0, 65535)];

        let results = auto_assign_rogue(&handle, &[BROADCAST_ADDRESS, 0x10], &slots, 2).await;

        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn auto_assign_rogue_binds_into_lowest_free_slot() {
        let target = radio_address_addr(3);
        let echo = build_write_echo(SLAVE_ID, target, 0x2222);
        let transport = MockTransport::new(vec![echo]);
        let handle = spawn_modbus_actor(transport, SLAVE_ID, Duration::from_millis(50));
        let slots = vec![slot(1, 0x10, 10), slot(2, BROADCAST_ADDRESS, 0), slot(3, 0, 65535)];

        let results = auto_assign_rogue(&handle, &[0x2222], &slots, 2).await;

        assert_eq!(results, vec![(0x2222, Ok(3))]);
    }

    #[tokio::test]
    async fn auto_assign_rogue_rolls_back_failed_write_and_retries_next_address() {
        // The scan slot is 5; the only other free slot is 10. A write that
        // exhausts the retry budget for the first rogue must give that slot
        // back so the second rogue can still claim it.
        let target = radio_address_addr(10);
        let echo = build_write_echo(SLAVE_ID, target, 0x2222);
        let transport = MockTransport::with_failures(RETRY_BUDGET as usize, vec![echo]);
        let handle = spawn_modbus_actor(transport, SLAVE_ID, Duration::from_millis(50));
        let slots = vec![slot(5, BROADCAST_ADDRESS, 0), slot(10, 0, 65535)];

        let results = auto_assign_rogue(&handle, &[0x1111, 0x2222], &slots, 5).await;

        assert_eq!(results[0].0, 0x1111);
        assert!(matches!(&results[0].1, Err(SlotManagerError::NoCapacity(0x1111))));
        assert_eq!(results[1], (0x2222, Ok(10)));
    }

    #[tokio::test]
    async fn disable_stale_writes_zero_to_every_inactive_slot() {
        let slots = vec![slot(1, 0x10, 5), slot(2, 0x20, 65535), slot(3, 0, 65535)];
        let echo = build_write_echo(SLAVE_ID, radio_address_addr(2), 0);
        let transport = MockTransport::new(vec![echo]);
        let log = transport.log_handle();
        let handle = spawn_modbus_actor(transport, SLAVE_ID, Duration::from_millis(50));

        let disabled = disable_stale(&handle, &slots).await.unwrap();

        assert_eq!(disabled, vec![2]);
        let requests = log.lock().unwrap();
        assert_eq!(requests.len(), 1);
        let addr = radio_address_addr(2).to_be_bytes();
        assert_eq!(&requests[0][0..6], &[SLAVE_ID, WRITE_SINGLE_REGISTER, addr[0], addr[1], 0x00, 0x00]);
    }

    #[tokio::test]
    async fn setup_scan_slot_opens_lowest_unused_slot_with_broadcast_address() {
        let slots = vec![slot(1, 0x10, 5), slot(2, 0, 65535), slot(3, 0, 65535)];
        let echo = build_write_echo(SLAVE_ID, radio_address_addr(2), BROADCAST_ADDRESS);
        let transport = MockTransport::new(vec![echo]);
        let log = transport.log_handle();
        let handle = spawn_modbus_actor(transport, SLAVE_ID, Duration::from_millis(50));

        let opened = setup_scan_slot(&handle, &slots).await.unwrap();

        assert_eq!(opened, 2);
        let requests = log.lock().unwrap();
        let addr = radio_address_addr(2).to_be_bytes();
        let value = BROADCAST_ADDRESS.to_be_bytes();
        assert_eq!(&requests[0][0..6], &[SLAVE_ID, WRITE_SINGLE_REGISTER, addr[0], addr[1], value[0], value[1]]);
    }

    #[tokio::test]
    async fn setup_scan_slot_fails_when_every_slot_is_already_bound() {
        let slots = vec![slot(1, 0x10, 5), slot(2, 0x20, 5)];
        let transport = MockTransport::new(vec![]);
        let handle = spawn_modbus_actor(transport, SLAVE_ID, Duration::from_millis(50));

        let err = setup_scan_slot(&handle, &slots).await.unwrap_err();

        assert!(matches!(err, SlotManagerError::NoCapacity(BROADCAST_ADDRESS)));
    }

    #[tokio::test]
    async fn monitor_for_rogues_collects_addresses_seen_within_threshold() {
        // Two poll iterations: the first address is within the "seen"
        // window and gets collected; the second is stale and is dropped.
        let responses = vec![
            build_read_response(SLAVE_ID, &[7]),
            build_read_response(SLAVE_ID, &[2]),
            build_read_response(SLAVE_ID, &[9]),
            build_read_response(SLAVE_ID, &[10]),
        ];
        let transport = MockTransport::new(responses);
        let handle = spawn_modbus_actor(transport, SLAVE_ID, Duration::from_millis(50));

        let seen = monitor_for_rogues(&handle, 5, Duration::from_millis(7), Duration::from_millis(5))
            .await
            .unwrap();

        assert_eq!(seen, vec![7]);
    }
}
