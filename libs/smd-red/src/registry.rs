//! Register table shared by every Red device
//!
//! The schema is a fixed, ordered list of typed registers. A register's
//! position in the list is its wire index, so the order below must match the
//! firmware exactly. The first six registers form the mandatory frame prefix.

use crate::error::{Result, SmdError};

/// Frame header constant
pub const HEADER: u8 = 0x55;

/// Product family tag of the Red motor driver
pub const DEVICE_FAMILY: u8 = 0xBA;

/// Number of registers that make up the frame prefix
pub const PREFIX_REGISTERS: usize = 6;

/// Wire type of a register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    /// Unsigned 8-bit
    Byte,
    /// Unsigned 16-bit
    Half,
    /// Unsigned 32-bit
    Word,
    /// Signed 32-bit
    SignedWord,
    /// IEEE-754 single precision
    Float,
}

impl TypeTag {
    /// Encoded size in bytes
    pub const fn size(self) -> usize {
        match self {
            TypeTag::Byte => 1,
            TypeTag::Half => 2,
            TypeTag::Word | TypeTag::SignedWord | TypeTag::Float => 4,
        }
    }
}

/// A typed register value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RegisterValue {
    Byte(u8),
    Half(u16),
    Word(u32),
    SignedWord(i32),
    Float(f32),
}

impl RegisterValue {
    pub fn type_tag(&self) -> TypeTag {
        match self {
            RegisterValue::Byte(_) => TypeTag::Byte,
            RegisterValue::Half(_) => TypeTag::Half,
            RegisterValue::Word(_) => TypeTag::Word,
            RegisterValue::SignedWord(_) => TypeTag::SignedWord,
            RegisterValue::Float(_) => TypeTag::Float,
        }
    }

    /// Append the little-endian encoding to `out`
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match *self {
            RegisterValue::Byte(v) => out.push(v),
            RegisterValue::Half(v) => out.extend_from_slice(&v.to_le_bytes()),
            RegisterValue::Word(v) => out.extend_from_slice(&v.to_le_bytes()),
            RegisterValue::SignedWord(v) => out.extend_from_slice(&v.to_le_bytes()),
            RegisterValue::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
        }
    }

    /// Decode a little-endian value of type `tag` from the start of `bytes`
    pub fn decode(tag: TypeTag, bytes: &[u8]) -> Result<Self> {
        let size = tag.size();
        let raw = bytes.get(..size).ok_or_else(|| {
            SmdError::malformed(format!(
                "need {} bytes for {:?}, have {}",
                size,
                tag,
                bytes.len()
            ))
        })?;

        Ok(match tag {
            TypeTag::Byte => RegisterValue::Byte(raw[0]),
            TypeTag::Half => RegisterValue::Half(u16::from_le_bytes([raw[0], raw[1]])),
            TypeTag::Word => {
                RegisterValue::Word(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
            },
            TypeTag::SignedWord => {
                RegisterValue::SignedWord(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
            },
            TypeTag::Float => {
                RegisterValue::Float(f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
            },
        })
    }

    pub fn as_u8(&self) -> Option<u8> {
        match *self {
            RegisterValue::Byte(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> Option<u16> {
        match *self {
            RegisterValue::Half(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match *self {
            RegisterValue::Word(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match *self {
            RegisterValue::SignedWord(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            RegisterValue::Float(v) => Some(v),
            _ => None,
        }
    }
}

macro_rules! register_schema {
    ($($name:ident => $tag:ident),* $(,)?) => {
        /// Register index, in wire order
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u8)]
        pub enum Index {
            $($name),*
        }

        impl Index {
            /// Every register, ordered by wire index
            pub const ALL: &'static [Index] = &[$(Index::$name),*];

            /// Wire type of this register
            pub const fn type_tag(self) -> TypeTag {
                match self {
                    $(Index::$name => TypeTag::$tag),*
                }
            }

            pub const fn name(self) -> &'static str {
                match self {
                    $(Index::$name => stringify!($name)),*
                }
            }
        }
    };
}

register_schema! {
    Header => Byte,
    DeviceId => Byte,
    DeviceFamily => Byte,
    PackageSize => Byte,
    Command => Byte,
    Status => Byte,
    HardwareVersion => Word,
    SoftwareVersion => Word,
    Baudrate => Word,
    OperationMode => Byte,
    TorqueEnable => Byte,
    OutputShaftCpr => Float,
    OutputShaftRpm => Float,
    UserIndicator => Byte,
    MinimumPositionLimit => SignedWord,
    MaximumPositionLimit => SignedWord,
    TorqueLimit => Half,
    VelocityLimit => Half,
    PositionFf => Float,
    VelocityFf => Float,
    TorqueFf => Float,
    PositionDeadband => Float,
    VelocityDeadband => Float,
    TorqueDeadband => Float,
    PositionOutputLimit => Float,
    VelocityOutputLimit => Float,
    TorqueOutputLimit => Float,
    PositionScalerGain => Float,
    PositionPGain => Float,
    PositionIGain => Float,
    PositionDGain => Float,
    VelocityScalerGain => Float,
    VelocityPGain => Float,
    VelocityIGain => Float,
    VelocityDGain => Float,
    TorqueScalerGain => Float,
    TorquePGain => Float,
    TorqueIGain => Float,
    TorqueDGain => Float,
    SetPosition => Float,
    PositionControlMode => Byte,
    SCurveSetpoint => Float,
    SCurveAccel => Float,
    SCurveMaxVelocity => Float,
    SCurveTime => Float,
    SetVelocity => Float,
    SetVelocityAcceleration => Float,
    SetTorque => Float,
    SetDutyCycle => Float,
    SetScanModuleMode => Byte,
    SetManualBuzzer => Byte,
    SetManualServo => Byte,
    SetManualRgb => Byte,
    SetManualButton => Byte,
    SetManualLight => Byte,
    SetManualJoystick => Byte,
    SetManualDistance => Byte,
    SetManualQtr => Byte,
    SetManualPot => Byte,
    SetManualImu => Byte,
    Buzzer1 => SignedWord,
    Buzzer2 => SignedWord,
    Buzzer3 => SignedWord,
    Buzzer4 => SignedWord,
    Buzzer5 => SignedWord,
    Servo1 => Byte,
    Servo2 => Byte,
    Servo3 => Byte,
    Servo4 => Byte,
    Servo5 => Byte,
    Rgb1 => SignedWord,
    Rgb2 => SignedWord,
    Rgb3 => SignedWord,
    Rgb4 => SignedWord,
    Rgb5 => SignedWord,
    PresentPosition => Float,
    PresentVelocity => Float,
    MotorCurrent => Float,
    AnalogPort => Half,
    Button1 => Byte,
    Button2 => Byte,
    Button3 => Byte,
    Button4 => Byte,
    Button5 => Byte,
    Light1 => Half,
    Light2 => Half,
    Light3 => Half,
    Light4 => Half,
    Light5 => Half,
    Joystick1 => SignedWord,
    Joystick2 => SignedWord,
    Joystick3 => SignedWord,
    Joystick4 => SignedWord,
    Joystick5 => SignedWord,
    Distance1 => Half,
    Distance2 => Half,
    Distance3 => Half,
    Distance4 => Half,
    Distance5 => Half,
    Qtr1 => SignedWord,
    Qtr2 => SignedWord,
    Qtr3 => SignedWord,
    Qtr4 => SignedWord,
    Qtr5 => SignedWord,
    Pot1 => Byte,
    Pot2 => Byte,
    Pot3 => Byte,
    Pot4 => Byte,
    Pot5 => Byte,
    Imu1 => Float,
    Imu2 => Float,
    Imu3 => Float,
    Imu4 => Float,
    Imu5 => Float,
    ConnectedBitfieldLow => Word,
    ConnectedBitfieldHigh => Word,
    CrcValue => Word,
}

impl Index {
    /// Wire index byte
    pub const fn wire(self) -> u8 {
        self as u8
    }

    /// Look up a register by its wire index byte
    pub fn from_wire(byte: u8) -> Option<Index> {
        Self::ALL.get(byte as usize).copied()
    }

    /// Encoded size of this register's value
    pub const fn size(self) -> usize {
        self.type_tag().size()
    }

    /// Protocol constants that must never be written
    pub const fn is_const(self) -> bool {
        matches!(self, Index::Header | Index::DeviceFamily)
    }

    /// Register `offset` places after `self`, if it exists
    pub fn offset(self, offset: usize) -> Option<Index> {
        Self::ALL.get(self as usize + offset).copied()
    }
}

/// One named slot of the register table
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub index: Index,
    pub tag: TypeTag,
    pub is_const: bool,
    /// Absent until read or written
    pub value: Option<RegisterValue>,
}

/// Per-device instance of the register table
#[derive(Debug, Clone, PartialEq)]
pub struct Registry {
    vars: Vec<Variable>,
}

impl Registry {
    /// Fresh table with the prefix constants and the device ID filled in
    pub fn new(device_id: u8) -> Self {
        let vars = Index::ALL
            .iter()
            .map(|&index| Variable {
                index,
                tag: index.type_tag(),
                is_const: index.is_const(),
                value: None,
            })
            .collect();

        let mut registry = Self { vars };
        registry.store(Index::Header, RegisterValue::Byte(HEADER));
        registry.store(Index::DeviceId, RegisterValue::Byte(device_id));
        registry.store(Index::DeviceFamily, RegisterValue::Byte(DEVICE_FAMILY));
        registry
    }

    /// Size in bytes of a type tag
    pub fn size_of(tag: TypeTag) -> usize {
        tag.size()
    }

    pub fn get(&self, index: Index) -> Option<RegisterValue> {
        self.vars[index as usize].value
    }

    pub fn variable(&self, index: Index) -> &Variable {
        &self.vars[index as usize]
    }

    /// Store a value, rejecting a variant that does not match the register's tag
    pub fn set(&mut self, index: Index, value: RegisterValue) -> Result<()> {
        check_type(index, &value)?;
        self.store(index, value);
        Ok(())
    }

    /// Device ID currently held by this table
    pub fn device_id(&self) -> Option<u8> {
        self.get(Index::DeviceId).and_then(|v| v.as_u8())
    }

    pub fn variables(&self) -> &[Variable] {
        &self.vars
    }

    fn store(&mut self, index: Index, value: RegisterValue) {
        self.vars[index as usize].value = Some(value);
    }
}

/// Type-check a value against the register it targets
pub fn check_type(index: Index, value: &RegisterValue) -> Result<()> {
    let expected = index.type_tag();
    let actual = value.type_tag();
    if expected != actual {
        return Err(SmdError::TypeMismatch {
            index,
            expected,
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_type_sizes() {
        assert_eq!(Registry::size_of(TypeTag::Byte), 1);
        assert_eq!(Registry::size_of(TypeTag::Half), 2);
        assert_eq!(Registry::size_of(TypeTag::Word), 4);
        assert_eq!(Registry::size_of(TypeTag::SignedWord), 4);
        assert_eq!(Registry::size_of(TypeTag::Float), 4);
    }

    #[test]
    fn test_schema_order() {
        assert_eq!(Index::Header.wire(), 0);
        assert_eq!(Index::Status.wire(), 5);
        assert_eq!(Index::OperationMode.wire(), 9);
        assert_eq!(Index::Buzzer1.wire(), 60);
        assert_eq!(Index::Button1.wire(), 79);
        assert_eq!(Index::Imu5.wire(), 113);
        assert_eq!(Index::ConnectedBitfieldHigh.wire(), Index::ConnectedBitfieldLow.wire() + 1);
        assert_eq!(Index::ALL.len(), 117);

        for (position, index) in Index::ALL.iter().enumerate() {
            assert_eq!(index.wire() as usize, position);
            assert_eq!(Index::from_wire(position as u8), Some(*index));
        }
        assert_eq!(Index::from_wire(200), None);
    }

    #[test]
    fn test_new_registry_prefix() {
        let registry = Registry::new(7);
        assert_eq!(registry.get(Index::Header), Some(RegisterValue::Byte(HEADER)));
        assert_eq!(registry.device_id(), Some(7));
        assert_eq!(
            registry.get(Index::DeviceFamily),
            Some(RegisterValue::Byte(DEVICE_FAMILY))
        );
        assert_eq!(registry.get(Index::PresentPosition), None);
        assert!(registry.variable(Index::Header).is_const);
        assert!(!registry.variable(Index::SetPosition).is_const);
    }

    #[test]
    fn test_set_type_checked() {
        let mut registry = Registry::new(1);
        registry
            .set(Index::OutputShaftCpr, RegisterValue::Float(6533.0))
            .unwrap();
        assert_eq!(
            registry.get(Index::OutputShaftCpr),
            Some(RegisterValue::Float(6533.0))
        );

        let err = registry
            .set(Index::OutputShaftCpr, RegisterValue::Byte(1))
            .unwrap_err();
        assert!(matches!(
            err,
            SmdError::TypeMismatch {
                expected: TypeTag::Float,
                actual: TypeTag::Byte,
                ..
            }
        ));
    }

    #[test]
    fn test_value_encode_decode_preserves_bits() {
        let samples = [
            RegisterValue::Byte(0xAB),
            RegisterValue::Half(0xBEEF),
            RegisterValue::Word(0xDEAD_BEEF),
            RegisterValue::SignedWord(-123_456),
            RegisterValue::Float(-0.15625),
            RegisterValue::Float(f32::MAX),
        ];

        for value in samples {
            let mut bytes = Vec::new();
            value.encode_into(&mut bytes);
            assert_eq!(bytes.len(), value.type_tag().size());
            let decoded = RegisterValue::decode(value.type_tag(), &bytes).unwrap();
            assert_eq!(decoded, value);
        }

        let nan = f32::from_bits(0x7FC0_0001);
        let mut bytes = Vec::new();
        RegisterValue::Float(nan).encode_into(&mut bytes);
        let decoded = RegisterValue::decode(TypeTag::Float, &bytes).unwrap();
        assert_eq!(decoded.as_f32().unwrap().to_bits(), nan.to_bits());
    }

    #[test]
    fn test_decode_too_short() {
        let err = RegisterValue::decode(TypeTag::Word, &[1, 2]).unwrap_err();
        assert!(matches!(err, SmdError::MalformedFrame(_)));
    }

    #[test]
    fn test_index_offset() {
        assert_eq!(Index::Button1.offset(4), Some(Index::Button5));
        assert_eq!(Index::CrcValue.offset(1), None);
    }
}
