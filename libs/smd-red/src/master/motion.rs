//! Motor control verbs
//!
//! Thin wrappers over register reads and writes. Setters are fire-and-forget
//! writes; getters are single READ transactions.

use super::Master;
use crate::error::{Result, SmdError};
use crate::registry::{Index, RegisterValue};
use crate::transport::Transport;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Acceleration value meaning "no ramp"
pub const MAX_ACCEL: f32 = f32::MAX;

/// Motor control mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OperationMode {
    Pwm = 0,
    Position = 1,
    Velocity = 2,
    Torque = 3,
}

impl OperationMode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(OperationMode::Pwm),
            1 => Some(OperationMode::Position),
            2 => Some(OperationMode::Velocity),
            3 => Some(OperationMode::Torque),
            _ => None,
        }
    }
}

/// One of the three cascaded control loops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlLoop {
    Position,
    Velocity,
    Torque,
}

impl ControlLoop {
    /// P, I, D, deadband, feed-forward and output limit registers
    fn registers(self) -> [Index; 6] {
        match self {
            ControlLoop::Position => [
                Index::PositionPGain,
                Index::PositionIGain,
                Index::PositionDGain,
                Index::PositionDeadband,
                Index::PositionFf,
                Index::PositionOutputLimit,
            ],
            ControlLoop::Velocity => [
                Index::VelocityPGain,
                Index::VelocityIGain,
                Index::VelocityDGain,
                Index::VelocityDeadband,
                Index::VelocityFf,
                Index::VelocityOutputLimit,
            ],
            ControlLoop::Torque => [
                Index::TorquePGain,
                Index::TorqueIGain,
                Index::TorqueDGain,
                Index::TorqueDeadband,
                Index::TorqueFf,
                Index::TorqueOutputLimit,
            ],
        }
    }
}

/// Control loop tuning; `None` fields are left unchanged on write
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ControlParameters {
    pub p: Option<f32>,
    pub i: Option<f32>,
    pub d: Option<f32>,
    pub deadband: Option<f32>,
    pub feed_forward: Option<f32>,
    pub output_limit: Option<f32>,
}

impl ControlParameters {
    fn fields(&self) -> [Option<f32>; 6] {
        [
            self.p,
            self.i,
            self.d,
            self.deadband,
            self.feed_forward,
            self.output_limit,
        ]
    }
}

/// How a position move blocks
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionWait {
    /// Accepted distance from the target, in encoder ticks
    pub tolerance: f32,
    /// Give up after this long; `None` polls forever
    pub timeout: Option<Duration>,
}

impl MotionWait {
    pub fn new(tolerance: f32) -> Self {
        Self {
            tolerance,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl<T: Transport> Master<T> {
    pub fn set_operation_mode(&mut self, id: u8, mode: OperationMode) -> Result<()> {
        self.write_one(id, Index::OperationMode, RegisterValue::Byte(mode as u8))
    }

    pub fn get_operation_mode(&mut self, id: u8) -> Result<OperationMode> {
        let raw = self.read_as(id, Index::OperationMode, RegisterValue::as_u8)?;
        OperationMode::from_u8(raw)
            .ok_or_else(|| SmdError::malformed(format!("unknown operation mode {}", raw)))
    }

    pub fn enable_torque(&mut self, id: u8, enable: bool) -> Result<()> {
        self.write_one(id, Index::TorqueEnable, RegisterValue::Byte(u8::from(enable)))
    }

    /// Encoder counts per output shaft revolution
    pub fn set_shaft_cpr(&mut self, id: u8, cpr: f32) -> Result<()> {
        self.write_one(id, Index::OutputShaftCpr, RegisterValue::Float(cpr))
    }

    pub fn get_shaft_cpr(&mut self, id: u8) -> Result<f32> {
        self.read_as(id, Index::OutputShaftCpr, RegisterValue::as_f32)
    }

    /// Rated output shaft speed
    pub fn set_shaft_rpm(&mut self, id: u8, rpm: f32) -> Result<()> {
        self.write_one(id, Index::OutputShaftRpm, RegisterValue::Float(rpm))
    }

    pub fn get_shaft_rpm(&mut self, id: u8) -> Result<f32> {
        self.read_as(id, Index::OutputShaftRpm, RegisterValue::as_f32)
    }

    /// Blink the on-board indicator
    pub fn set_user_indicator(&mut self, id: u8) -> Result<()> {
        self.write_one(id, Index::UserIndicator, RegisterValue::Byte(1))
    }

    pub fn set_position_limits(&mut self, id: u8, min: i32, max: i32) -> Result<()> {
        if min > max {
            return Err(SmdError::invalid_argument(format!(
                "minimum position limit {} exceeds maximum {}",
                min, max
            )));
        }
        self.set_variables(
            id,
            &[
                (Index::MinimumPositionLimit, RegisterValue::SignedWord(min)),
                (Index::MaximumPositionLimit, RegisterValue::SignedWord(max)),
            ],
            false,
        )?;
        Ok(())
    }

    /// `(minimum, maximum)` position limits
    pub fn get_position_limits(&mut self, id: u8) -> Result<(i32, i32)> {
        let values = self.get_variables(
            id,
            &[Index::MinimumPositionLimit, Index::MaximumPositionLimit],
        )?;
        match values.as_slice() {
            [RegisterValue::SignedWord(min), RegisterValue::SignedWord(max)] => Ok((*min, *max)),
            _ => Err(SmdError::malformed("unexpected position limits response")),
        }
    }

    pub fn set_torque_limit(&mut self, id: u8, limit: u16) -> Result<()> {
        self.write_one(id, Index::TorqueLimit, RegisterValue::Half(limit))
    }

    pub fn get_torque_limit(&mut self, id: u8) -> Result<u16> {
        self.read_as(id, Index::TorqueLimit, RegisterValue::as_u16)
    }

    pub fn set_velocity_limit(&mut self, id: u8, limit: u16) -> Result<()> {
        self.write_one(id, Index::VelocityLimit, RegisterValue::Half(limit))
    }

    pub fn get_velocity_limit(&mut self, id: u8) -> Result<u16> {
        self.read_as(id, Index::VelocityLimit, RegisterValue::as_u16)
    }

    // ========================================================================
    // Setpoints
    // ========================================================================

    /// Step straight to `position` without a trajectory
    pub fn set_position(&mut self, id: u8, position: f32) -> Result<()> {
        self.set_variables(
            id,
            &[
                (Index::PositionControlMode, RegisterValue::Byte(0)),
                (Index::SetPosition, RegisterValue::Float(position)),
            ],
            false,
        )?;
        Ok(())
    }

    pub fn get_position(&mut self, id: u8) -> Result<f32> {
        self.read_as(id, Index::PresentPosition, RegisterValue::as_f32)
    }

    /// Velocity setpoint with an optional ramp
    ///
    /// `accel == 0.0` keeps the current ramp; [`MAX_ACCEL`] disables ramping.
    pub fn set_velocity(&mut self, id: u8, velocity: f32, accel: f32) -> Result<()> {
        if accel == MAX_ACCEL {
            self.write_one(id, Index::SetVelocityAcceleration, RegisterValue::Float(0.0))?;
        } else if accel != 0.0 {
            self.write_one(id, Index::SetVelocityAcceleration, RegisterValue::Float(accel))?;
        }
        self.write_one(id, Index::SetVelocity, RegisterValue::Float(velocity))
    }

    pub fn get_velocity(&mut self, id: u8) -> Result<f32> {
        self.read_as(id, Index::PresentVelocity, RegisterValue::as_f32)
    }

    pub fn set_torque(&mut self, id: u8, torque: f32) -> Result<()> {
        self.write_one(id, Index::SetTorque, RegisterValue::Float(torque))
    }

    /// Present motor current
    pub fn get_torque(&mut self, id: u8) -> Result<f32> {
        self.read_as(id, Index::MotorCurrent, RegisterValue::as_f32)
    }

    /// PWM duty cycle in percent, -100..=100
    pub fn set_duty_cycle(&mut self, id: u8, percent: f32) -> Result<()> {
        if !(-100.0..=100.0).contains(&percent) {
            return Err(SmdError::invalid_argument(format!(
                "duty cycle must be in [-100, 100], got {}",
                percent
            )));
        }
        self.write_one(id, Index::SetDutyCycle, RegisterValue::Float(percent))
    }

    pub fn get_analog_port(&mut self, id: u8) -> Result<u16> {
        self.read_as(id, Index::AnalogPort, RegisterValue::as_u16)
    }

    // ========================================================================
    // Tuning
    // ========================================================================

    /// Write the provided fields of one loop's parameter set
    pub fn set_control_parameters(
        &mut self,
        id: u8,
        control: ControlLoop,
        params: &ControlParameters,
    ) -> Result<()> {
        let values: Vec<(Index, RegisterValue)> = control
            .registers()
            .into_iter()
            .zip(params.fields())
            .filter_map(|(index, field)| field.map(|v| (index, RegisterValue::Float(v))))
            .collect();
        if values.is_empty() {
            return Err(SmdError::invalid_argument("no control parameters given"));
        }
        self.set_variables(id, &values, false)?;
        Ok(())
    }

    pub fn get_control_parameters(&mut self, id: u8, control: ControlLoop) -> Result<ControlParameters> {
        let values = self.get_variables(id, &control.registers())?;
        let floats: Vec<f32> = values.iter().filter_map(RegisterValue::as_f32).collect();
        match floats.as_slice() {
            [p, i, d, deadband, feed_forward, output_limit] => Ok(ControlParameters {
                p: Some(*p),
                i: Some(*i),
                d: Some(*d),
                deadband: Some(*deadband),
                feed_forward: Some(*feed_forward),
                output_limit: Some(*output_limit),
            }),
            _ => Err(SmdError::malformed("unexpected control parameters response")),
        }
    }

    // ========================================================================
    // Trajectories
    // ========================================================================

    /// S-curve move to `target`
    ///
    /// With a [`MotionWait`] this blocks until the position is within
    /// tolerance.
    pub fn go_to(
        &mut self,
        id: u8,
        target: f32,
        time: f32,
        max_speed: f32,
        accel: f32,
        wait: Option<MotionWait>,
    ) -> Result<()> {
        self.write_one(id, Index::PositionControlMode, RegisterValue::Byte(1))?;
        self.set_variables(
            id,
            &[
                (Index::SCurveTime, RegisterValue::Float(time)),
                (Index::SCurveMaxVelocity, RegisterValue::Float(max_speed)),
                (Index::SCurveAccel, RegisterValue::Float(accel)),
            ],
            false,
        )?;
        self.write_one(id, Index::SCurveSetpoint, RegisterValue::Float(target))?;

        match wait {
            Some(wait) => self.wait_for_position(id, target, wait),
            None => Ok(()),
        }
    }

    /// Move to `target` at a constant `speed`
    pub fn go_to_constant_speed(
        &mut self,
        id: u8,
        target: f32,
        speed: f32,
        wait: Option<MotionWait>,
    ) -> Result<()> {
        self.write_one(id, Index::PositionControlMode, RegisterValue::Byte(1))?;
        self.set_variables(
            id,
            &[
                (Index::SCurveMaxVelocity, RegisterValue::Float(speed)),
                (Index::SCurveAccel, RegisterValue::Float(MAX_ACCEL)),
            ],
            false,
        )?;
        self.write_one(id, Index::SCurveSetpoint, RegisterValue::Float(target))?;

        match wait {
            Some(wait) => self.wait_for_position(id, target, wait),
            None => Ok(()),
        }
    }

    /// Poll the present position until it is within tolerance of `target`
    ///
    /// Polls that get no valid response are retried.
    pub fn wait_for_position(&mut self, id: u8, target: f32, wait: MotionWait) -> Result<()> {
        let start = Instant::now();
        let mut position = f32::NAN;

        loop {
            match self.get_position(id) {
                Ok(present) => {
                    position = present;
                    if (target - present).abs() <= wait.tolerance {
                        debug!("Device {} reached {}", id, present);
                        return Ok(());
                    }
                },
                Err(e) if e.is_no_response() => debug!("Position poll: {}", e),
                Err(e) => return Err(e),
            }

            if let Some(timeout) = wait.timeout {
                if start.elapsed() >= timeout {
                    warn!("Motion timeout: device {} at {}, target {}", id, position, target);
                    return Err(SmdError::MotionTimeout {
                        id,
                        target,
                        position,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::codec::{self, Command};
    use crate::device::Device;
    use crate::transport::ScriptedTransport;

    fn master() -> Master<ScriptedTransport> {
        let mut master = Master::with_transport(ScriptedTransport::new(), 115_200).unwrap();
        master.attach(Device::new(1).unwrap());
        master
    }

    fn position_response(position: f32) -> Vec<u8> {
        codec::encode_response(
            1,
            Command::Read,
            &[(Index::PresentPosition, RegisterValue::Float(position))],
        )
        .unwrap()
    }

    #[test]
    fn test_operation_mode_codes() {
        assert_eq!(OperationMode::Pwm as u8, 0);
        assert_eq!(OperationMode::Torque as u8, 3);
        assert_eq!(OperationMode::from_u8(2), Some(OperationMode::Velocity));
        assert_eq!(OperationMode::from_u8(4), None);
    }

    #[test]
    fn test_set_velocity_ramp_variants() {
        let mut master = master();

        master.set_velocity(1, 100.0, 0.0).unwrap();
        assert_eq!(master.transport().writes().len(), 1);

        master.transport_mut().clear_events();
        master.set_velocity(1, 100.0, MAX_ACCEL).unwrap();
        let writes = master.transport().writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0][6], Index::SetVelocityAcceleration.wire());
        assert_eq!(&writes[0][7..11], &0.0f32.to_le_bytes());
        assert_eq!(writes[1][6], Index::SetVelocity.wire());

        master.transport_mut().clear_events();
        master.set_velocity(1, 100.0, 25.0).unwrap();
        let writes = master.transport().writes();
        assert_eq!(&writes[0][7..11], &25.0f32.to_le_bytes());
    }

    #[test]
    fn test_duty_cycle_range() {
        let mut master = master();
        assert!(master.set_duty_cycle(1, 100.0).is_ok());
        assert!(master.set_duty_cycle(1, -100.0).is_ok());
        assert!(matches!(
            master.set_duty_cycle(1, 100.5),
            Err(SmdError::InvalidArgument(_))
        ));
        assert!(master.set_duty_cycle(1, f32::NAN).is_err());
        assert_eq!(master.transport().writes().len(), 2);
    }

    #[test]
    fn test_control_parameters() {
        let mut master = master();
        let params = ControlParameters {
            p: Some(1.5),
            d: Some(0.25),
            ..Default::default()
        };
        master
            .set_control_parameters(1, ControlLoop::Velocity, &params)
            .unwrap();

        let writes = master.transport().writes();
        let frame = writes[0];
        assert_eq!(frame.len(), 6 + 5 + 5 + 4);
        assert_eq!(frame[6], Index::VelocityPGain.wire());
        assert_eq!(frame[11], Index::VelocityDGain.wire());

        let err = master
            .set_control_parameters(1, ControlLoop::Torque, &ControlParameters::default())
            .unwrap_err();
        assert!(err.is_precondition());
    }

    #[test]
    fn test_get_control_parameters() {
        let mut master = master();
        let values: Vec<(Index, RegisterValue)> = ControlLoop::Position
            .registers()
            .iter()
            .enumerate()
            .map(|(n, index)| (*index, RegisterValue::Float(n as f32)))
            .collect();
        master
            .transport_mut()
            .push_response(codec::encode_response(1, Command::Read, &values).unwrap());

        let params = master.get_control_parameters(1, ControlLoop::Position).unwrap();
        assert_eq!(params.p, Some(0.0));
        assert_eq!(params.deadband, Some(3.0));
        assert_eq!(params.output_limit, Some(5.0));
    }

    #[test]
    fn test_go_to_sequence() {
        let mut master = master();
        master.go_to(1, 500.0, 2.0, 300.0, 50.0, None).unwrap();

        let writes = master.transport().writes();
        assert_eq!(writes.len(), 3);
        assert_eq!(&writes[0][6..8], &[Index::PositionControlMode.wire(), 1]);
        assert_eq!(writes[1][6], Index::SCurveTime.wire());
        assert_eq!(writes[1][11], Index::SCurveMaxVelocity.wire());
        assert_eq!(writes[1][16], Index::SCurveAccel.wire());
        assert_eq!(writes[2][6], Index::SCurveSetpoint.wire());
        assert_eq!(&writes[2][7..11], &500.0f32.to_le_bytes());
    }

    #[test]
    fn test_go_to_constant_speed_uses_max_accel() {
        let mut master = master();
        master.go_to_constant_speed(1, -20.0, 80.0, None).unwrap();

        let writes = master.transport().writes();
        assert_eq!(writes.len(), 3);
        // Speed and acceleration only; the S-curve time is left alone
        assert_eq!(writes[1].len(), 6 + 5 + 5 + 4);
        assert_eq!(writes[1][6], Index::SCurveMaxVelocity.wire());
        assert_eq!(&writes[1][7..11], &80.0f32.to_le_bytes());
        assert_eq!(writes[1][11], Index::SCurveAccel.wire());
        assert_eq!(&writes[1][12..16], &MAX_ACCEL.to_le_bytes());
    }

    #[test]
    fn test_blocking_move_polls_until_close() {
        let mut master = master();
        master.transport_mut().push_response(position_response(0.0));
        master.transport_mut().push_silence();
        master.transport_mut().push_response(position_response(495.0));

        master
            .go_to(1, 500.0, 1.0, 100.0, 10.0, Some(MotionWait::new(10.0)))
            .unwrap();
        assert_eq!(master.transport().pending_responses(), 0);
    }

    #[test]
    fn test_blocking_move_timeout() {
        let mut master = master();
        master.transport_mut().push_response(position_response(12.0));

        let wait = MotionWait::new(1.0).with_timeout(Duration::ZERO);
        let err = master
            .go_to_constant_speed(1, 500.0, 100.0, Some(wait))
            .unwrap_err();
        match err {
            SmdError::MotionTimeout {
                id,
                target,
                position,
            } => {
                assert_eq!(id, 1);
                assert_eq!(target, 500.0);
                assert_eq!(position, 12.0);
            },
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
