//! Serial port setup shared by the radio ingestion pipelines (C1) and the
//! Modbus client (C3). The core neither reconfigures the radio via AT
//! commands nor probes baud/parity at runtime (spec §6, §9) — it opens the
//! port exactly as configured and nothing else.

use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};

/// 8-N-1, no flow control, at the configured baud (spec §6).
pub fn open(port: &str, baud: u32) -> std::io::Result<SerialStream> {
    Ok(tokio_serial::new(port, baud)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .open_native_async()?)
}
