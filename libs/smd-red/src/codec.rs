//! Red bus frame codec
//!
//! Frame layout (all integers little-endian):
//!
//! ```text
//! header(0x55) | id | family(0xBA) | package size | command | status | payload | CRC32
//! ```
//!
//! The package size byte holds the total frame length including the CRC
//! trailer, so a frame never exceeds 255 bytes. The CRC is CRC-32/ISO-HDLC
//! over every byte before it.

use crate::error::{Result, SmdError};
use crate::registry::{
    check_type, Index, RegisterValue, Registry, DEVICE_FAMILY, HEADER, PREFIX_REGISTERS,
};
use crc::{Crc, CRC_32_ISO_HDLC};
use tracing::{debug, warn};

/// Length of the fixed frame prefix
pub const PREFIX_LEN: usize = PREFIX_REGISTERS;

/// Length of the CRC trailer
pub const CRC_LEN: usize = 4;

/// Largest frame the one-byte package size can describe
pub const MAX_FRAME_LEN: usize = u8::MAX as usize;

/// Length of a prefix-only acknowledgment
pub const SIMPLE_ACK_LEN: usize = PREFIX_LEN + CRC_LEN;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Command codes, in wire order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Write = 0,
    WriteAck = 1,
    Read = 2,
    Reboot = 3,
    HardReset = 4,
    EepromWrite = 5,
    EepromWriteAck = 6,
    Ping = 7,
    ResetEnc = 8,
    Tune = 9,
    ModuleScan = 10,
    BlJump = 11,
}

impl Command {
    pub fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            0 => Command::Write,
            1 => Command::WriteAck,
            2 => Command::Read,
            3 => Command::Reboot,
            4 => Command::HardReset,
            5 => Command::EepromWrite,
            6 => Command::EepromWriteAck,
            7 => Command::Ping,
            8 => Command::ResetEnc,
            9 => Command::Tune,
            10 => Command::ModuleScan,
            11 => Command::BlJump,
            _ => return None,
        })
    }

    /// True for commands whose frame carries no payload
    pub fn is_verb(self) -> bool {
        !matches!(self, Command::Write | Command::WriteAck | Command::Read)
    }
}

/// An encoded request together with what its response must look like
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: u8,
    pub command: Command,
    pub frame: Vec<u8>,
    /// Bytes to read back; zero for fire-and-forget commands
    pub ack_len: usize,
    /// Registers the response echoes, in order
    pub expected: Vec<Index>,
}

impl Request {
    pub fn expects_ack(&self) -> bool {
        self.ack_len > 0
    }
}

/// A CRC-validated frame split into its fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub device_id: u8,
    pub command: u8,
    pub status: u8,
    pub payload: Vec<u8>,
    pub crc: u32,
}

/// CRC-32/ISO-HDLC checksum
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Build a complete frame around `payload`
pub fn encode_frame(id: u8, command: Command, payload: &[u8]) -> Result<Vec<u8>> {
    let total = PREFIX_LEN + payload.len() + CRC_LEN;
    if total > MAX_FRAME_LEN {
        return Err(SmdError::FrameTooLarge(total));
    }

    let mut frame = Vec::with_capacity(total);
    frame.push(HEADER);
    frame.push(id);
    frame.push(DEVICE_FAMILY);
    frame.push(total as u8);
    frame.push(command as u8);
    frame.push(0); // status
    frame.extend_from_slice(payload);

    let crc = crc32(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());

    debug!(
        "Building frame: id={}, cmd={:?}, len={}, CRC={:08X}",
        id, command, total, crc
    );

    Ok(frame)
}

/// Acknowledgment length the device sends back for `command`
pub fn expected_ack_size(command: Command, indices: &[Index]) -> usize {
    match command {
        Command::WriteAck | Command::Read => {
            PREFIX_LEN + indices.iter().map(|i| 1 + i.size()).sum::<usize>() + CRC_LEN
        },
        Command::Ping
        | Command::ResetEnc
        | Command::EepromWrite
        | Command::EepromWriteAck
        | Command::ModuleScan => SIMPLE_ACK_LEN,
        Command::Write
        | Command::Reboot
        | Command::HardReset
        | Command::Tune
        | Command::BlJump => 0,
    }
}

fn value_payload(values: &[(Index, RegisterValue)]) -> Result<Vec<u8>> {
    let mut payload = Vec::with_capacity(values.iter().map(|(i, _)| 1 + i.size()).sum());
    for (index, value) in values {
        check_type(*index, value)?;
        payload.push(index.wire());
        value.encode_into(&mut payload);
    }
    Ok(payload)
}

fn check_ack_len(ack_len: usize) -> Result<()> {
    if ack_len > MAX_FRAME_LEN {
        return Err(SmdError::FrameTooLarge(ack_len));
    }
    Ok(())
}

/// WRITE or WRITE_ACK carrying `(index, value)` pairs
pub fn encode_write(id: u8, values: &[(Index, RegisterValue)], ack: bool) -> Result<Request> {
    if values.is_empty() {
        return Err(SmdError::invalid_argument("write needs at least one register"));
    }
    if let Some((index, _)) = values.iter().find(|(index, _)| index.is_const()) {
        return Err(SmdError::ReadOnly(*index));
    }

    let command = if ack { Command::WriteAck } else { Command::Write };
    let expected: Vec<Index> = values.iter().map(|(index, _)| *index).collect();
    let ack_len = expected_ack_size(command, &expected);
    check_ack_len(ack_len)?;

    let frame = encode_frame(id, command, &value_payload(values)?)?;
    Ok(Request {
        id,
        command,
        frame,
        ack_len,
        expected,
    })
}

/// READ of the listed registers
pub fn encode_read(id: u8, indices: &[Index]) -> Result<Request> {
    if indices.is_empty() {
        return Err(SmdError::invalid_argument("read needs at least one register"));
    }

    let ack_len = expected_ack_size(Command::Read, indices);
    check_ack_len(ack_len)?;

    let payload: Vec<u8> = indices.iter().map(|i| i.wire()).collect();
    let frame = encode_frame(id, Command::Read, &payload)?;
    Ok(Request {
        id,
        command: Command::Read,
        frame,
        ack_len,
        expected: indices.to_vec(),
    })
}

/// Prefix-only frame for a payload-less command
pub fn encode_verb(id: u8, command: Command) -> Result<Request> {
    if !command.is_verb() {
        return Err(SmdError::invalid_argument(format!(
            "{:?} carries a payload",
            command
        )));
    }

    let frame = encode_frame(id, command, &[])?;
    Ok(Request {
        id,
        command,
        frame,
        ack_len: expected_ack_size(command, &[]),
        expected: Vec::new(),
    })
}

/// Frame a device would send: prefix, echoed `(index, value)` pairs, CRC
pub fn encode_response(
    id: u8,
    command: Command,
    values: &[(Index, RegisterValue)],
) -> Result<Vec<u8>> {
    encode_frame(id, command, &value_payload(values)?)
}

/// Validate CRC, header, family and package size, then split the frame
pub fn parse_frame(bytes: &[u8]) -> Result<Frame> {
    if bytes.len() < SIMPLE_ACK_LEN {
        return Err(SmdError::ShortRead {
            expected: SIMPLE_ACK_LEN,
            received: bytes.len(),
        });
    }

    let body_len = bytes.len() - CRC_LEN;
    let (body, trailer) = bytes.split_at(body_len);
    let received = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let computed = crc32(body);
    if computed != received {
        warn!(
            "CRC mismatch: computed {:08X}, received {:08X}, frame {}",
            computed,
            received,
            hex::encode(bytes)
        );
        return Err(SmdError::CrcMismatch { computed, received });
    }

    if body[0] != HEADER {
        return Err(SmdError::malformed(format!(
            "invalid header: expected 0x{:02X}, got 0x{:02X}",
            HEADER, body[0]
        )));
    }
    if body[2] != DEVICE_FAMILY {
        return Err(SmdError::malformed(format!(
            "invalid device family: expected 0x{:02X}, got 0x{:02X}",
            DEVICE_FAMILY, body[2]
        )));
    }
    if body[3] as usize != bytes.len() {
        return Err(SmdError::malformed(format!(
            "package size {} does not match frame length {}",
            body[3],
            bytes.len()
        )));
    }

    Ok(Frame {
        device_id: body[1],
        command: body[4],
        status: body[5],
        payload: body[PREFIX_LEN..].to_vec(),
        crc: received,
    })
}

/// Validate an acknowledgment for `request` and store its values
///
/// The registry is only touched once the whole response has validated.
/// Returns the echoed values in request order.
pub fn decode_ack(
    bytes: &[u8],
    request: &Request,
    registry: &mut Registry,
) -> Result<Vec<RegisterValue>> {
    if bytes.len() < request.ack_len {
        warn!(
            "Short response from device {}: expected {} bytes, received {}",
            request.id,
            request.ack_len,
            bytes.len()
        );
        return Err(SmdError::ShortRead {
            expected: request.ack_len,
            received: bytes.len(),
        });
    }

    let frame = parse_frame(&bytes[..request.ack_len])?;
    if frame.device_id != request.id {
        return Err(SmdError::malformed(format!(
            "response from device {}, expected {}",
            frame.device_id, request.id
        )));
    }

    let mut values = Vec::with_capacity(request.expected.len());
    let mut cursor = frame.payload.as_slice();
    for index in &request.expected {
        let (&echoed, rest) = cursor
            .split_first()
            .ok_or_else(|| SmdError::malformed("payload ended early"))?;
        if echoed != index.wire() {
            return Err(SmdError::malformed(format!(
                "expected register {} ({}), got index {}",
                index.wire(),
                index.name(),
                echoed
            )));
        }
        let value = RegisterValue::decode(index.type_tag(), rest)?;
        cursor = &rest[index.size()..];
        values.push(value);
    }
    if !cursor.is_empty() {
        return Err(SmdError::malformed(format!(
            "{} trailing payload bytes",
            cursor.len()
        )));
    }

    for (index, value) in request.expected.iter().zip(&values) {
        registry.set(*index, *value)?;
    }

    debug!(
        "Decoded response from device {}: {} values",
        request.id,
        values.len()
    );

    Ok(values)
}
