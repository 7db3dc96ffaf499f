//! Byte transport under the transaction engine
//!
//! The Red bus has no framing or flow control of its own: the engine writes a
//! frame, waits a guard interval and reads a known number of bytes back.
//! [`SerialTransport`] does that over a real port; [`ScriptedTransport`]
//! replays canned responses and records every bus event.

use crate::error::{Result, SmdError};
use serialport::{ClearBuffer, SerialPort};
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Lowest supported bus rate
pub const MIN_BAUD: u32 = 3_053;

/// Highest supported bus rate
pub const MAX_BAUD: u32 = 12_500_000;

/// Default bus rate
pub const DEFAULT_BAUD: u32 = 115_200;

/// Default per-read timeout
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Reject rates outside the supported range
pub fn validate_baud(baud: u32) -> Result<()> {
    if !(MIN_BAUD..=MAX_BAUD).contains(&baud) {
        return Err(SmdError::invalid_argument(format!(
            "baud rate must be {}..={}, got {}",
            MIN_BAUD, MAX_BAUD, baud
        )));
    }
    Ok(())
}

/// Time for about twelve 10-bit characters to clear the wire
pub fn guard_interval(baud: u32) -> Duration {
    Duration::from_secs_f64((10.0 / f64::from(baud)) * 12.0)
}

/// Half-duplex byte pipe to the bus
pub trait Transport {
    /// Write a whole frame and flush it
    fn write_frame(&mut self, frame: &[u8]) -> Result<()>;

    /// Read up to `len` bytes; a timeout yields fewer
    fn read_frame(&mut self, len: usize) -> Result<Vec<u8>>;

    /// Block for `duration`
    fn pause(&mut self, duration: Duration) {
        thread::sleep(duration);
    }

    /// Drop any bytes waiting in the receive buffer
    fn discard_input(&mut self) -> Result<()>;

    /// Reopen at a new rate
    fn set_baud_rate(&mut self, baud: u32) -> Result<()>;

    /// Port identifier
    fn name(&self) -> &str;
}

/// Serial port transport
pub struct SerialTransport {
    path: String,
    baud: u32,
    timeout: Duration,
    port: Option<Box<dyn SerialPort>>,
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("path", &self.path)
            .field("baud", &self.baud)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl SerialTransport {
    /// Open `path` at `baud`, 8N1
    pub fn open(path: &str, baud: u32, timeout: Duration) -> Result<Self> {
        validate_baud(baud)?;
        let port = Self::open_port(path, baud, timeout)?;
        Ok(Self {
            path: path.to_string(),
            baud,
            timeout,
            port: Some(port),
        })
    }

    fn open_port(path: &str, baud: u32, timeout: Duration) -> Result<Box<dyn SerialPort>> {
        debug!("Serial: {} @{}baud", path, baud);
        match serialport::new(path, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(timeout)
            .open()
        {
            Ok(port) => {
                info!("Serial opened: {}", path);
                Ok(port)
            },
            Err(e) => {
                error!("Serial err: {} - {}", path, e);
                Err(SmdError::Serial(format!(
                    "Failed to open serial port {path}: {e}"
                )))
            },
        }
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| SmdError::Serial(format!("{} is closed", self.path)))
    }
}

impl Transport for SerialTransport {
    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let port = self.port()?;
        if let Err(e) = port.write_all(frame) {
            error!("TX: {}", e);
            return Err(e.into());
        }
        if let Err(e) = port.flush() {
            error!("TX flush: {}", e);
            return Err(e.into());
        }
        debug!("TX: {}B {}", frame.len(), hex::encode(frame));
        Ok(())
    }

    fn read_frame(&mut self, len: usize) -> Result<Vec<u8>> {
        let port = self.port()?;
        let mut buffer = vec![0u8; len];
        let mut total = 0;

        while total < len {
            match port.read(&mut buffer[total..]) {
                Ok(0) => {
                    error!("Serial closed");
                    break;
                },
                Ok(n) => total += n,
                Err(e) if e.kind() == ErrorKind::TimedOut => {
                    debug!("RX timeout: {}B of {}B", total, len);
                    break;
                },
                Err(e) => {
                    error!("RX: {}", e);
                    return Err(e.into());
                },
            }
        }

        buffer.truncate(total);
        debug!("RX: {}B {}", total, hex::encode(&buffer));
        Ok(buffer)
    }

    fn discard_input(&mut self) -> Result<()> {
        self.port()?.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        validate_baud(baud)?;
        // Ports are opened exclusively, so the old handle must close first
        drop(self.port.take());
        match Self::open_port(&self.path, baud, self.timeout) {
            Ok(port) => {
                self.port = Some(port);
                self.baud = baud;
                info!("Serial reopened: {} @{}baud", self.path, baud);
                Ok(())
            },
            Err(e) => {
                warn!("Serial reopen at {}baud failed: {}", baud, e);
                // Keep the bus usable at the previous rate
                self.port = Self::open_port(&self.path, self.baud, self.timeout).ok();
                Err(e)
            },
        }
    }

    fn name(&self) -> &str {
        &self.path
    }
}

/// One recorded bus interaction
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    Write(Vec<u8>),
    Read { requested: usize, returned: usize },
    Pause(Duration),
    Discard,
    Reopen(u32),
}

/// In-memory bus that replays queued responses
///
/// Each read consumes the next queued response, truncated to the requested
/// length. An empty queue reads as silence. Pauses are recorded, not slept.
#[derive(Debug, Clone)]
pub struct ScriptedTransport {
    name: String,
    baud: u32,
    responses: VecDeque<Vec<u8>>,
    events: Vec<BusEvent>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            name: "scripted".to_string(),
            baud: DEFAULT_BAUD,
            responses: VecDeque::new(),
            events: Vec::new(),
        }
    }

    /// Queue the bytes the next read returns
    pub fn push_response(&mut self, bytes: Vec<u8>) {
        self.responses.push_back(bytes);
    }

    /// Queue a read that times out with nothing
    pub fn push_silence(&mut self) {
        self.responses.push_back(Vec::new());
    }

    pub fn events(&self) -> &[BusEvent] {
        &self.events
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    /// Frames written so far
    pub fn writes(&self) -> Vec<&[u8]> {
        self.events
            .iter()
            .filter_map(|e| match e {
                BusEvent::Write(frame) => Some(frame.as_slice()),
                _ => None,
            })
            .collect()
    }

    pub fn pending_responses(&self) -> usize {
        self.responses.len()
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud
    }
}

impl Transport for ScriptedTransport {
    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        debug!("TX: {}B {}", frame.len(), hex::encode(frame));
        self.events.push(BusEvent::Write(frame.to_vec()));
        Ok(())
    }

    fn read_frame(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut bytes = self.responses.pop_front().unwrap_or_default();
        bytes.truncate(len);
        debug!("RX: {}B {}", bytes.len(), hex::encode(&bytes));
        self.events.push(BusEvent::Read {
            requested: len,
            returned: bytes.len(),
        });
        Ok(bytes)
    }

    fn pause(&mut self, duration: Duration) {
        self.events.push(BusEvent::Pause(duration));
    }

    fn discard_input(&mut self) -> Result<()> {
        self.events.push(BusEvent::Discard);
        Ok(())
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        validate_baud(baud)?;
        self.baud = baud;
        self.events.push(BusEvent::Reopen(baud));
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
