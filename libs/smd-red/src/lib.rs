//! SMD Red Driver
//!
//! Host-side driver for SMD "Red" motor boards sharing one half-duplex serial
//! bus. Layers, bottom up:
//!
//! - [`registry`]: the fixed, typed register table every board exposes
//! - [`codec`]: CRC32-checked frame encoding and response validation
//! - [`transport`]: the byte pipe (real serial port or scripted in-memory bus)
//! - [`master`]: the transaction engine with typed motor and module verbs
//! - [`discovery`]: add-on module scanning and manual module configuration
//!
//! ```no_run
//! use smd_red::{Device, Master, OperationMode};
//!
//! # fn main() -> smd_red::Result<()> {
//! let mut master = Master::open("/dev/ttyUSB0", 115_200)?;
//! master.attach(Device::new(0)?);
//! master.set_operation_mode(0, OperationMode::Velocity)?;
//! master.enable_torque(0, true)?;
//! master.set_velocity(0, 100.0, smd_red::MAX_ACCEL)?;
//! println!("position: {}", master.get_position(0)?);
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod master;
pub mod registry;
pub mod transport;

pub use codec::{Command, Frame, Request};
pub use config::BusConfig;
pub use device::{Device, DeviceTable, BROADCAST_ID, MAX_DEVICE_ID};
pub use discovery::{decode_bitfield, ModuleId, ModuleKind, ModuleMask};
pub use error::{Result, SmdError};
pub use logging::{init_logging, LogConfig, LogFormat};
pub use master::{
    ControlLoop, ControlParameters, DriverInfo, Master, MotionWait, OperationMode, Rgb, MAX_ACCEL,
};
pub use registry::{Index, RegisterValue, Registry, TypeTag, Variable};
pub use transport::{BusEvent, ScriptedTransport, SerialTransport, Transport};
