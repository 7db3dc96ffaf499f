//! Driver Error Types
//!
//! Every failure the driver can report, grouped the way callers branch on them:
//! precondition failures (nothing touched the bus), validation failures (a
//! response arrived but could not be trusted) and transport failures.

use crate::codec::Command;
use crate::registry::{Index, TypeTag};
use thiserror::Error;

/// Result type for smd-red operations
pub type Result<T> = std::result::Result<T, SmdError>;

/// Driver errors
#[derive(Debug, Error)]
pub enum SmdError {
    /// Out-of-range ID, baud rate, actuator value or malformed module name
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Module slot outside its category's register range
    #[error("Invalid index: {0}")]
    InvalidIndex(String),

    /// Addressed slot does not hold a device with that ID
    #[error("Device {0} is not attached")]
    NotAttached(u8),

    /// Value variant does not match the register's type tag
    #[error("Type mismatch for {index:?}: register is {expected:?}, value is {actual:?}")]
    TypeMismatch {
        index: Index,
        expected: TypeTag,
        actual: TypeTag,
    },

    /// Register is a protocol constant
    #[error("Register {0:?} is read-only")]
    ReadOnly(Index),

    /// Encoded frame would not fit the one-byte package size field
    #[error("Frame too large: {0} bytes (max 255)")]
    FrameTooLarge(usize),

    /// Trailing CRC does not match the recomputed one
    #[error("CRC mismatch: computed 0x{computed:08X}, received 0x{received:08X}")]
    CrcMismatch { computed: u32, received: u32 },

    /// Fewer bytes arrived than the acknowledgment size predicts
    #[error("Short read: expected {expected} bytes, received {received}")]
    ShortRead { expected: usize, received: usize },

    /// Response passed the CRC check but its structure is wrong
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// An acknowledged command got no valid acknowledgment
    #[error("Device {id} did not acknowledge {command:?}: {source}")]
    AckFailed {
        id: u8,
        command: Command,
        #[source]
        source: Box<SmdError>,
    },

    /// EEPROM write acknowledgment absent
    #[error("EEPROM write acknowledgment failed for device {id}: {source}")]
    EepromAckMissing {
        id: u8,
        #[source]
        source: Box<SmdError>,
    },

    /// Blocking move did not settle before its deadline
    #[error("Device {id} did not reach {target} in time (last position {position})")]
    MotionTimeout { id: u8, target: f32, position: f32 },

    /// Serial port errors
    #[error("Serial error: {0}")]
    Serial(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<serialport::Error> for SmdError {
    fn from(err: serialport::Error) -> Self {
        SmdError::Serial(err.to_string())
    }
}

impl From<figment::Error> for SmdError {
    fn from(err: figment::Error) -> Self {
        SmdError::Config(err.to_string())
    }
}

// Helper methods for creating errors
impl SmdError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        SmdError::InvalidArgument(msg.into())
    }

    pub fn invalid_index(msg: impl Into<String>) -> Self {
        SmdError::InvalidIndex(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        SmdError::MalformedFrame(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        SmdError::Config(msg.into())
    }

    /// True when a response was expected but nothing trustworthy arrived
    pub fn is_no_response(&self) -> bool {
        match self {
            SmdError::CrcMismatch { .. }
            | SmdError::ShortRead { .. }
            | SmdError::MalformedFrame(_) => true,
            SmdError::AckFailed { source, .. } | SmdError::EepromAckMissing { source, .. } => {
                source.is_no_response()
            },
            _ => false,
        }
    }

    /// True for failures detected before any bus I/O
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            SmdError::InvalidArgument(_)
                | SmdError::InvalidIndex(_)
                | SmdError::NotAttached(_)
                | SmdError::TypeMismatch { .. }
                | SmdError::ReadOnly(_)
                | SmdError::FrameTooLarge(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_response_classification() {
        let crc = SmdError::CrcMismatch {
            computed: 1,
            received: 2,
        };
        assert!(crc.is_no_response());
        assert!(!crc.is_precondition());

        let wrapped = SmdError::AckFailed {
            id: 3,
            command: Command::Ping,
            source: Box::new(SmdError::ShortRead {
                expected: 10,
                received: 0,
            }),
        };
        assert!(wrapped.is_no_response());
    }

    #[test]
    fn test_precondition_classification() {
        assert!(SmdError::NotAttached(4).is_precondition());
        assert!(SmdError::invalid_argument("bad").is_precondition());
        assert!(!SmdError::Serial("gone".into()).is_precondition());
    }

    #[test]
    fn test_error_messages() {
        let err = SmdError::CrcMismatch {
            computed: 0xDEADBEEF,
            received: 0x01,
        };
        assert_eq!(
            err.to_string(),
            "CRC mismatch: computed 0xDEADBEEF, received 0x00000001"
        );
        assert_eq!(SmdError::NotAttached(7).to_string(), "Device 7 is not attached");
    }
}
