//! Transaction engine
//!
//! [`Master`] owns the device table and the bus handle. Every operation is a
//! blocking request/response exchange: encode, write, wait out the guard
//! interval where the protocol needs it, read the predicted number of bytes
//! and validate them. Precondition failures never touch the bus.

mod motion;
mod peripherals;

pub use motion::{ControlLoop, ControlParameters, MotionWait, OperationMode, MAX_ACCEL};
pub use peripherals::{Rgb, MODULE_SLOTS};

use crate::codec::{self, Command, Request};
use crate::config::BusConfig;
use crate::device::{Device, DeviceTable, BROADCAST_ID, MAX_DEVICE_ID};
use crate::error::{Result, SmdError};
use crate::registry::{Index, RegisterValue};
use crate::transport::{guard_interval, validate_baud, SerialTransport, Transport};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Settle time the board needs to probe its module ports
pub const DEFAULT_SCAN_SETTLE: Duration = Duration::from_millis(5500);

/// Bitfield polls after a module scan
pub const DEFAULT_SCAN_RETRIES: usize = 10;

/// Firmware and board revision strings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverInfo {
    pub hardware_version: String,
    pub software_version: String,
}

/// Render a packed version word as `vMAJOR.MINOR.PATCH`
pub fn format_version(word: u32) -> String {
    format!(
        "v{}.{}.{}",
        (word >> 16) & 0xFF,
        (word >> 8) & 0xFF,
        word & 0xFF
    )
}

/// Bus master for a chain of Red boards
#[derive(Debug)]
pub struct Master<T: Transport = SerialTransport> {
    transport: T,
    devices: DeviceTable,
    baud: u32,
    guard: Duration,
    // An acknowledgment was sent back but never read
    unread_ack: bool,
    pub(crate) scan_settle: Duration,
    pub(crate) scan_retries: usize,
}

impl Master<SerialTransport> {
    /// Open a serial port at `baud`
    pub fn open(port: &str, baud: u32) -> Result<Self> {
        let transport = SerialTransport::open(port, baud, crate::transport::DEFAULT_READ_TIMEOUT)?;
        Self::with_transport(transport, baud)
    }

    /// Open the port described by `config`
    pub fn from_config(config: &BusConfig) -> Result<Self> {
        config.validate()?;
        let transport = SerialTransport::open(&config.port, config.baud_rate, config.read_timeout())?;
        Ok(Self::with_transport(transport, config.baud_rate)?
            .with_scan_timing(config.scan_settle(), config.scan_retries))
    }
}

impl<T: Transport> Master<T> {
    /// Drive the bus through an already-open transport running at `baud`
    pub fn with_transport(transport: T, baud: u32) -> Result<Self> {
        validate_baud(baud)?;
        info!("Master on {} @{}baud", transport.name(), baud);
        Ok(Self {
            transport,
            devices: DeviceTable::new(),
            baud,
            guard: guard_interval(baud),
            unread_ack: false,
            scan_settle: DEFAULT_SCAN_SETTLE,
            scan_retries: DEFAULT_SCAN_RETRIES,
        })
    }

    /// Override module scan settle time and bitfield poll count
    pub fn with_scan_timing(mut self, settle: Duration, retries: usize) -> Self {
        self.scan_settle = settle;
        self.scan_retries = retries.max(1);
        self
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud
    }

    /// Post-write wait derived from the baud rate
    pub fn guard_interval(&self) -> Duration {
        self.guard
    }

    pub fn port_name(&self) -> &str {
        self.transport.name()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Raw bus access, e.g. for a firmware flasher after `enter_bootloader`
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    // ========================================================================
    // Device table
    // ========================================================================

    /// Register a device under its ID, replacing any previous record
    pub fn attach(&mut self, device: Device) -> Option<Device> {
        info!("Attach: device {}", device.id());
        self.devices.attach(device)
    }

    pub fn detach(&mut self, id: u8) -> Option<Device> {
        info!("Detach: device {}", id);
        self.devices.detach(id)
    }

    /// IDs of all attached devices, ascending
    pub fn attached(&self) -> Vec<u8> {
        self.devices.attached()
    }

    /// Cached record for `id`
    pub fn device(&self, id: u8) -> Option<&Device> {
        self.devices.get(id)
    }

    pub(crate) fn check_target(&self, id: u8, broadcast: bool) -> Result<()> {
        if id == BROADCAST_ID {
            if broadcast {
                return Ok(());
            }
            return Err(SmdError::invalid_argument(
                "broadcast ID 255 cannot be used for acknowledged requests",
            ));
        }
        if !self.devices.is_attached(id) {
            return Err(SmdError::NotAttached(id));
        }
        Ok(())
    }

    // ========================================================================
    // Register access
    // ========================================================================

    /// Write registers on `id`
    ///
    /// With `ack` the device echoes the written registers and the validated
    /// echo is returned and cached. Without it nothing is read back, the
    /// guard interval elapses and an empty list is returned. Broadcast (255)
    /// is only accepted without `ack`.
    pub fn set_variables(
        &mut self,
        id: u8,
        values: &[(Index, RegisterValue)],
        ack: bool,
    ) -> Result<Vec<RegisterValue>> {
        self.check_target(id, !ack)?;
        let request = codec::encode_write(id, values, ack)?;

        if !ack {
            self.execute(&request, false)?;
            return Ok(Vec::new());
        }

        self.execute(&request, true).map_err(|e| {
            warn!("Write ack failed: device {} - {}", id, e);
            SmdError::AckFailed {
                id,
                command: request.command,
                source: Box::new(e),
            }
        })
    }

    /// Read registers from `id`, in request order
    pub fn get_variables(&mut self, id: u8, indices: &[Index]) -> Result<Vec<RegisterValue>> {
        if id == BROADCAST_ID {
            return Err(SmdError::invalid_argument("cannot read with broadcast ID 255"));
        }
        self.check_target(id, false)?;
        let request = codec::encode_read(id, indices)?;
        self.execute(&request, true)
    }

    fn execute(&mut self, request: &Request, read: bool) -> Result<Vec<RegisterValue>> {
        debug!(
            "Transaction: device {} {:?}, ack {}B",
            request.id, request.command, request.ack_len
        );
        if read && self.unread_ack {
            self.discard_stale_input()?;
        }
        self.transport.write_frame(&request.frame)?;

        if !read {
            self.transport.pause(self.guard);
            if request.ack_len > 0 {
                self.unread_ack = true;
            }
            return Ok(Vec::new());
        }
        // Acknowledged writes are answered immediately; everything else is
        // read after the guard interval
        if request.command != Command::WriteAck {
            self.transport.pause(self.guard);
        }

        let bytes = self.transport.read_frame(request.ack_len)?;
        let device = self
            .devices
            .get_mut(request.id)
            .ok_or(SmdError::NotAttached(request.id))?;
        codec::decode_ack(&bytes, request, device.registry_mut())
    }

    pub(crate) fn discard_stale_input(&mut self) -> Result<()> {
        debug!("Discarding unread acknowledgments on {}", self.transport.name());
        self.transport.discard_input()?;
        self.unread_ack = false;
        Ok(())
    }

    pub(crate) fn read_as<V>(
        &mut self,
        id: u8,
        index: Index,
        pick: fn(&RegisterValue) -> Option<V>,
    ) -> Result<V> {
        let values = self.get_variables(id, &[index])?;
        values
            .first()
            .and_then(pick)
            .ok_or_else(|| SmdError::malformed(format!("no {} value in response", index.name())))
    }

    pub(crate) fn write_one(&mut self, id: u8, index: Index, value: RegisterValue) -> Result<()> {
        self.set_variables(id, &[(index, value)], false)?;
        Ok(())
    }

    // ========================================================================
    // Verbs
    // ========================================================================

    pub(crate) fn send_verb(&mut self, id: u8, command: Command) -> Result<()> {
        let read = matches!(command, Command::Ping | Command::EepromWriteAck);
        self.check_target(id, !read)?;
        let request = codec::encode_verb(id, command)?;
        self.execute(&request, read)?;
        Ok(())
    }

    pub fn reboot(&mut self, id: u8) -> Result<()> {
        self.send_verb(id, Command::Reboot)
    }

    /// Restore factory defaults
    pub fn factory_reset(&mut self, id: u8) -> Result<()> {
        self.send_verb(id, Command::HardReset)
    }

    /// Persist the current configuration to EEPROM
    ///
    /// With `ack` a missing or invalid acknowledgment is reported as
    /// [`SmdError::EepromAckMissing`].
    pub fn eeprom_write(&mut self, id: u8, ack: bool) -> Result<()> {
        if !ack {
            return self.send_verb(id, Command::EepromWrite);
        }
        match self.send_verb(id, Command::EepromWriteAck) {
            Err(e) if !e.is_precondition() => {
                warn!("EEPROM ack failed: device {} - {}", id, e);
                Err(SmdError::EepromAckMissing {
                    id,
                    source: Box::new(e),
                })
            },
            other => other,
        }
    }

    /// Check that `id` answers
    pub fn ping(&mut self, id: u8) -> Result<()> {
        match self.send_verb(id, Command::Ping) {
            Err(e) if !e.is_precondition() => {
                warn!("Ping failed: device {} - {}", id, e);
                Err(SmdError::AckFailed {
                    id,
                    command: Command::Ping,
                    source: Box::new(e),
                })
            },
            other => other,
        }
    }

    /// Zero the encoder position
    pub fn reset_encoder(&mut self, id: u8) -> Result<()> {
        self.send_verb(id, Command::ResetEnc)
    }

    /// Start the on-board PID auto-tuner
    pub fn pid_tune(&mut self, id: u8) -> Result<()> {
        self.send_verb(id, Command::Tune)
    }

    /// Jump to the bootloader; the bus then belongs to the flasher
    pub fn enter_bootloader(&mut self, id: u8) -> Result<()> {
        info!("Bootloader jump: device {}", id);
        self.send_verb(id, Command::BlJump)
    }

    // ========================================================================
    // Device maintenance
    // ========================================================================

    pub fn get_driver_info(&mut self, id: u8) -> Result<DriverInfo> {
        let values = self.get_variables(id, &[Index::HardwareVersion, Index::SoftwareVersion])?;
        match values.as_slice() {
            [RegisterValue::Word(hardware), RegisterValue::Word(software)] => Ok(DriverInfo {
                hardware_version: format_version(*hardware),
                software_version: format_version(*software),
            }),
            _ => Err(SmdError::malformed("unexpected driver info response")),
        }
    }

    /// Change a device's ID
    ///
    /// The new ID is written under the current one, then committed with an
    /// EEPROM write and a reboot. The device answers to `new_id` afterwards;
    /// the caller detaches `id` and attaches `new_id`.
    pub fn update_driver_id(&mut self, id: u8, new_id: u8) -> Result<()> {
        for value in [id, new_id] {
            if value > MAX_DEVICE_ID {
                return Err(SmdError::invalid_argument(format!(
                    "device ID must be 0..={}, got {}",
                    MAX_DEVICE_ID, value
                )));
            }
        }
        self.check_target(id, false)?;

        info!("Driver ID: {} -> {}", id, new_id);
        self.write_one(id, Index::DeviceId, RegisterValue::Byte(new_id))?;
        self.eeprom_write(id, false)?;
        self.reboot(id)
    }

    /// Change a device's baud rate; takes effect after the reboot
    pub fn update_driver_baudrate(&mut self, id: u8, baud: u32) -> Result<()> {
        validate_baud(baud)?;
        self.check_target(id, false)?;

        info!("Driver baud: device {} -> {}", id, baud);
        self.write_one(id, Index::Baudrate, RegisterValue::Word(baud))?;
        self.eeprom_write(id, false)?;
        self.reboot(id)
    }

    pub fn get_driver_baudrate(&mut self, id: u8) -> Result<u32> {
        self.read_as(id, Index::Baudrate, RegisterValue::as_u32)
    }

    /// Reopen the bus at `baud` and recompute the guard interval
    pub fn update_master_baudrate(&mut self, baud: u32) -> Result<()> {
        validate_baud(baud)?;
        self.transport.set_baud_rate(baud)?;
        self.baud = baud;
        self.guard = guard_interval(baud);
        info!("Master baud: {}", baud);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::transport::{BusEvent, ScriptedTransport};

    fn master_with(ids: &[u8]) -> Master<ScriptedTransport> {
        let mut master = Master::with_transport(ScriptedTransport::new(), 115_200).unwrap();
        for &id in ids {
            master.attach(Device::new(id).unwrap());
        }
        master
    }

    #[test]
    fn test_format_version() {
        assert_eq!(format_version(0x0001_0203), "v1.2.3");
        assert_eq!(format_version(0xFF00_0A00), "v0.10.0");
    }

    #[test]
    fn test_rejects_bad_baud() {
        assert!(Master::with_transport(ScriptedTransport::new(), 3_052).is_err());
        assert!(Master::with_transport(ScriptedTransport::new(), 12_500_001).is_err());
    }

    #[test]
    fn test_ack_write_reads_without_pause() {
        let mut master = master_with(&[2]);
        let response = codec::encode_response(
            2,
            Command::WriteAck,
            &[(Index::TorqueEnable, RegisterValue::Byte(1))],
        )
        .unwrap();
        master.transport_mut().push_response(response);

        let values = master
            .set_variables(2, &[(Index::TorqueEnable, RegisterValue::Byte(1))], true)
            .unwrap();
        assert_eq!(values, vec![RegisterValue::Byte(1)]);

        let events = master.transport().events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], BusEvent::Write(_)));
        assert!(matches!(events[1], BusEvent::Read { requested: 12, .. }));
    }

    #[test]
    fn test_broadcast_rules() {
        let mut master = master_with(&[]);

        master
            .set_variables(BROADCAST_ID, &[(Index::TorqueEnable, RegisterValue::Byte(0))], false)
            .unwrap();
        master.reboot(BROADCAST_ID).unwrap();
        assert_eq!(master.transport().writes().len(), 2);
        master.transport_mut().clear_events();

        let err = master
            .set_variables(BROADCAST_ID, &[(Index::TorqueEnable, RegisterValue::Byte(0))], true)
            .unwrap_err();
        assert!(matches!(err, SmdError::InvalidArgument(_)));
        assert!(master.ping(BROADCAST_ID).unwrap_err().is_precondition());
        assert!(master.eeprom_write(BROADCAST_ID, true).unwrap_err().is_precondition());
        assert!(master.transport().events().is_empty());
    }

    #[test]
    fn test_ping() {
        let mut master = master_with(&[6]);
        master
            .transport_mut()
            .push_response(codec::encode_response(6, Command::Ping, &[]).unwrap());
        master.ping(6).unwrap();

        master.transport_mut().push_silence();
        let err = master.ping(6).unwrap_err();
        assert!(matches!(
            err,
            SmdError::AckFailed {
                id: 6,
                command: Command::Ping,
                ..
            }
        ));
        assert!(err.is_no_response());
    }

    #[test]
    fn test_eeprom_write_ack_missing() {
        let mut master = master_with(&[4]);
        master.transport_mut().push_silence();
        let err = master.eeprom_write(4, true).unwrap_err();
        assert!(matches!(err, SmdError::EepromAckMissing { id: 4, .. }));

        master.transport_mut().clear_events();
        master.eeprom_write(4, false).unwrap();
        let events = master.transport().events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], BusEvent::Pause(master.guard_interval()));
    }

    #[test]
    fn test_unread_ack_discarded_before_next_read() {
        let mut master = master_with(&[4]);
        master.reset_encoder(4).unwrap();
        master.transport_mut().push_response(
            codec::encode_response(
                4,
                Command::Read,
                &[(Index::PresentPosition, RegisterValue::Float(0.0))],
            )
            .unwrap(),
        );
        master.get_variables(4, &[Index::PresentPosition]).unwrap();

        let events = master.transport().events();
        assert_eq!(events.len(), 6);
        assert_eq!(events[2], BusEvent::Discard);
        assert!(matches!(events[3], BusEvent::Write(_)));
        assert!(matches!(events[5], BusEvent::Read { .. }));

        // Nothing left to drop on the following read
        master.transport_mut().clear_events();
        master.transport_mut().push_silence();
        assert!(master.get_variables(4, &[Index::PresentPosition]).is_err());
        assert!(!master.transport().events().contains(&BusEvent::Discard));
    }

    #[test]
    fn test_update_driver_id_sequence() {
        let mut master = master_with(&[5]);
        master.update_driver_id(5, 9).unwrap();

        let writes = master.transport().writes();
        assert_eq!(writes.len(), 3);
        // All three go out under the current ID
        assert!(writes.iter().all(|frame| frame[1] == 5));
        assert_eq!(writes[0][4], Command::Write as u8);
        assert_eq!(&writes[0][6..8], &[Index::DeviceId.wire(), 9]);
        assert_eq!(writes[1][4], Command::EepromWrite as u8);
        assert_eq!(writes[2][4], Command::Reboot as u8);

        // Cached record is untouched until the caller re-attaches
        assert!(master.device(5).is_some());
        assert!(master.update_driver_id(5, 255).is_err());
    }

    #[test]
    fn test_driver_info() {
        let mut master = master_with(&[1]);
        let response = codec::encode_response(
            1,
            Command::Read,
            &[
                (Index::HardwareVersion, RegisterValue::Word(0x0001_0000)),
                (Index::SoftwareVersion, RegisterValue::Word(0x0000_0309)),
            ],
        )
        .unwrap();
        master.transport_mut().push_response(response);

        let info = master.get_driver_info(1).unwrap();
        assert_eq!(info.hardware_version, "v1.0.0");
        assert_eq!(info.software_version, "v0.3.9");
    }

    #[test]
    fn test_update_master_baudrate() {
        let mut master = master_with(&[]);
        master.update_master_baudrate(9_600).unwrap();
        assert_eq!(master.baud_rate(), 9_600);
        assert_eq!(master.guard_interval(), guard_interval(9_600));
        assert_eq!(master.transport().events(), &[BusEvent::Reopen(9_600)]);

        assert!(master.update_master_baudrate(100).is_err());
        assert_eq!(master.baud_rate(), 9_600);
    }

    #[test]
    fn test_driver_baudrate() {
        let mut master = master_with(&[3]);
        master.update_driver_baudrate(3, 57_600).unwrap();
        let writes = master.transport().writes();
        assert_eq!(writes.len(), 3);
        assert_eq!(writes[0][6], Index::Baudrate.wire());
        assert_eq!(&writes[0][7..11], &57_600u32.to_le_bytes());

        assert!(master.update_driver_baudrate(3, 1_000).is_err());

        master.transport_mut().push_response(
            codec::encode_response(
                3,
                Command::Read,
                &[(Index::Baudrate, RegisterValue::Word(57_600))],
            )
            .unwrap(),
        );
        assert_eq!(master.get_driver_baudrate(3).unwrap(), 57_600);
    }
}
