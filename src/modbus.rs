//! C3: a single-flight Modbus RTU client for the controller's holding
//! register map (spec §4.3). The RS-485 bus has exactly one reader at a
//! time, so this module is built as an actor: [`ModbusActor`] owns the
//! transport and a FIFO request queue; callers only ever see a cloneable
//! [`ModbusHandle`].

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant};
use tracing::warn;

use crate::error::ModbusError;

pub(crate) const READ_HOLDING_REGISTERS: u8 = 0x03;
pub(crate) const WRITE_SINGLE_REGISTER: u8 = 0x06;
pub(crate) const EXCEPTION_BIT: u8 = 0x80;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
pub(crate) const RETRY_BUDGET: u8 = 3;
/// Inter-request pause during a full 32-slot scan, enough for controller
/// turnaround at 9600 baud (spec §4.3).
pub const SCAN_INTER_REQUEST_PAUSE: Duration = Duration::from_millis(20);

fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

pub(crate) fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16_modbus(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

fn verify_crc(frame: &[u8]) -> bool {
    if frame.len() < 2 {
        return false;
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    let expected = crc16_modbus(body);
    tail == expected.to_le_bytes()
}

/// Anything that can carry bytes to and from the controller. Implemented
/// for any `AsyncRead + AsyncWrite` type (serial ports, in-memory mocks).
pub trait ModbusTransport: Send {
    fn write_all(&mut self, buf: &[u8]) -> impl std::future::Future<Output = std::io::Result<()>> + Send;
    fn read(&mut self, buf: &mut [u8]) -> impl std::future::Future<Output = std::io::Result<usize>> + Send;
}

impl<S> ModbusTransport for S
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        AsyncWriteExt::write_all(self, buf).await
    }

    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        AsyncReadExt::read(self, buf).await
    }
}

/// Register addresses are wire (0-based) addresses, derived from the slot
/// index per spec §4.3's table. Some end-user configuration tools label
/// these +1 ("base-1"); that relabelling is strictly outside the core
/// (spec §9 Open Question b).
pub fn radio_address_addr(slot: u8) -> u16 {
    0x00 + (slot as u16 - 1)
}
pub fn reading_addr(slot: u8) -> u16 {
    0x20 + 2 * (slot as u16 - 1)
}
pub fn mode_addr(slot: u8) -> u16 {
    0x60 + (slot as u16 - 1)
}
pub fn battery_addr(slot: u8) -> u16 {
    0x80 + 2 * (slot as u16 - 1)
}
pub fn time_since_addr(slot: u8) -> u16 {
    0xC0 + (slot as u16 - 1)
}
pub fn sensor_type_addr(slot: u8) -> u16 {
    0xE0 + (slot as u16 - 1)
}
pub fn gas_type_addr(slot: u8) -> u16 {
    0x100 + (slot as u16 - 1)
}

/// Two consecutive registers, MSW-first, big-endian within each register.
/// Must never be word-swapped (spec §4.3).
pub fn decode_f32(regs: &[u16]) -> f32 {
    let [a0, a1] = regs[0].to_be_bytes();
    let [b0, b1] = regs[1].to_be_bytes();
    f32::from_be_bytes([a0, a1, b0, b1])
}

struct ModbusClient<T: ModbusTransport> {
    transport: T,
    slave_id: u8,
    timeout: Duration,
}

impl<T: ModbusTransport> ModbusClient<T> {
    async fn read_at_least(&mut self, buf: &mut Vec<u8>, n: usize, deadline: Instant) -> Result<(), ModbusError> {
        let mut scratch = [0u8; 64];
        while buf.len() < n {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ModbusError::Timeout(self.timeout));
            }
            match timeout(remaining, self.transport.read(&mut scratch)).await {
                Ok(Ok(0)) => return Err(ModbusError::Timeout(self.timeout)),
                Ok(Ok(n)) => buf.extend_from_slice(&scratch[..n]),
                Ok(Err(e)) => return Err(ModbusError::Framing(e.to_string())),
                Err(_) => return Err(ModbusError::Timeout(self.timeout)),
            }
        }
        Ok(())
    }

    async fn exchange_once(&mut self, request: &[u8], expect_func: u8) -> Result<Vec<u8>, ModbusError> {
        self.transport
            .write_all(request)
            .await
            .map_err(|e| ModbusError::Framing(e.to_string()))?;

        let deadline = Instant::now() + self.timeout;
        let mut buf = Vec::new();
        self.read_at_least(&mut buf, 2, deadline).await?;

        if buf[0] != self.slave_id {
            return Err(ModbusError::Framing(format!(
                "slave id mismatch: expected {}, got {}",
                self.slave_id, buf[0]
            )));
        }

        let func = buf[1];
        if func == (expect_func | EXCEPTION_BIT) {
            self.read_at_least(&mut buf, 5, deadline).await?;
            if !verify_crc(&buf[..5]) {
                return Err(ModbusError::Crc);
            }
            return Err(ModbusError::Exception(buf[2]));
        }
        if func != expect_func {
            return Err(ModbusError::Framing(format!(
                "unexpected function byte 0x{func:02x}"
            )));
        }

        let total_len = if expect_func == READ_HOLDING_REGISTERS {
            self.read_at_least(&mut buf, 3, deadline).await?;
            3 + buf[2] as usize + 2
        } else {
            8
        };
        self.read_at_least(&mut buf, total_len, deadline).await?;
        buf.truncate(total_len);

        if !verify_crc(&buf) {
            return Err(ModbusError::Crc);
        }
        Ok(buf)
    }

    async fn exchange_with_retry(&mut self, request: &[u8], expect_func: u8) -> Result<Vec<u8>, ModbusError> {
        let mut last_err = None;
        for attempt in 1..=RETRY_BUDGET {
            match self.exchange_once(request, expect_func).await {
                Ok(resp) => return Ok(resp),
                Err(ModbusError::Exception(code)) => return Err(ModbusError::Exception(code)),
                Err(e) => {
                    warn!(attempt, error = %e, "modbus request failed, retrying");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.expect("loop runs at least once"))
    }

    async fn read_holding_registers(&mut self, addr: u16, count: u16) -> Result<Vec<u16>, ModbusError> {
        let mut request = vec![self.slave_id, READ_HOLDING_REGISTERS];
        request.extend_from_slice(&addr.to_be_bytes());
        request.extend_from_slice(&count.to_be_bytes());
        append_crc(&mut request);

        let resp = self.exchange_with_retry(&request, READ_HOLDING_REGISTERS).await?;
        let byte_count = resp[2] as usize;
        if byte_count != 2 * count as usize {
            return Err(ModbusError::Framing(format!(
                "byte count {byte_count} does not match requested register count {count}"
            )));
        }
        let data = &resp[3..3 + byte_count];
        Ok(data
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect())
    }

    async fn write_single_register(&mut self, addr: u16, value: u16) -> Result<(), ModbusError> {
        let mut request = vec![self.slave_id, WRITE_SINGLE_REGISTER];
        request.extend_from_slice(&addr.to_be_bytes());
        request.extend_from_slice(&value.to_be_bytes());
        append_crc(&mut request);

        self.exchange_with_retry(&request, WRITE_SINGLE_REGISTER).await?;
        Ok(())
    }
}

enum ModbusRequest {
    ReadHoldingRegisters {
        addr: u16,
        count: u16,
        respond_to: oneshot::Sender<Result<Vec<u16>, ModbusError>>,
    },
    WriteSingleRegister {
        addr: u16,
        value: u16,
        respond_to: oneshot::Sender<Result<(), ModbusError>>,
    },
}

/// Cloneable front for the single-flight Modbus actor. Every method queues
/// a request and awaits its own reply; the actor processes the queue FIFO.
#[derive(Clone)]
pub struct ModbusHandle {
    tx: mpsc::Sender<ModbusRequest>,
}

impl ModbusHandle {
    pub async fn read_holding_registers(&self, addr: u16, count: u16) -> Result<Vec<u16>, ModbusError> {
        let (respond_to, rx) = oneshot::channel();
        self.tx
            .send(ModbusRequest::ReadHoldingRegisters {
                addr,
                count,
                respond_to,
            })
            .await
            .map_err(|_| ModbusError::Framing("modbus actor stopped".into()))?;
        rx.await
            .map_err(|_| ModbusError::Framing("modbus actor dropped the request".into()))?
    }

    pub async fn write_single_register(&self, addr: u16, value: u16) -> Result<(), ModbusError> {
        let (respond_to, rx) = oneshot::channel();
        self.tx
            .send(ModbusRequest::WriteSingleRegister {
                addr,
                value,
                respond_to,
            })
            .await
            .map_err(|_| ModbusError::Framing("modbus actor stopped".into()))?;
        rx.await
            .map_err(|_| ModbusError::Framing("modbus actor dropped the request".into()))?
    }

    pub async fn read_u16(&self, addr: u16) -> Result<u16, ModbusError> {
        Ok(self.read_holding_registers(addr, 1).await?[0])
    }

    pub async fn read_f32(&self, addr: u16) -> Result<f32, ModbusError> {
        let regs = self.read_holding_registers(addr, 2).await?;
        Ok(decode_f32(&regs))
    }
}

/// Owns the transport; drains requests off the queue one at a time. Spawn
/// with [`spawn_modbus_actor`].
pub struct ModbusActor<T: ModbusTransport> {
    client: ModbusClient<T>,
    rx: mpsc::Receiver<ModbusRequest>,
}

impl<T: ModbusTransport> ModbusActor<T> {
    async fn run(mut self) {
        while let Some(req) = self.rx.recv().await {
            match req {
                ModbusRequest::ReadHoldingRegisters {
                    addr,
                    count,
                    respond_to,
                } => {
                    let result = self.client.read_holding_registers(addr, count).await;
                    let _ = respond_to.send(result);
                }
                ModbusRequest::WriteSingleRegister {
                    addr,
                    value,
                    respond_to,
                } => {
                    let result = self.client.write_single_register(addr, value).await;
                    let _ = respond_to.send(result);
                }
            }
        }
    }
}

pub fn spawn_modbus_actor<T>(transport: T, slave_id: u8, timeout: Duration) -> ModbusHandle
where
    T: ModbusTransport + 'static,
{
    let (tx, rx) = mpsc::channel(32);
    let actor = ModbusActor {
        client: ModbusClient {
            transport,
            slave_id,
            timeout,
        },
        rx,
    };
    tokio::spawn(actor.run());
    ModbusHandle { tx }
}

pub fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}
