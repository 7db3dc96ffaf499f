//! Add-on module discovery
//!
//! After a MODULE_SCAN the board reports attached modules in a 64-bit
//! bitfield spread over two registers. Category `k` owns bits `5k..5k+5`, one
//! per slot. The board can also be told which modules are present, bypassing
//! the probe.

use crate::codec::Command;
use crate::error::{Result, SmdError};
use crate::master::Master;
use crate::registry::{Index, RegisterValue};
use crate::transport::Transport;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

/// Bits reserved per category
const SLOTS_PER_KIND: u32 = 5;

const KIND_COUNT: usize = 10;

/// Module category, in bitfield order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModuleKind {
    Button,
    Light,
    Buzzer,
    Joystick,
    Distance,
    Qtr,
    Servo,
    Pot,
    Rgb,
    Imu,
}

impl ModuleKind {
    pub const ALL: [ModuleKind; KIND_COUNT] = [
        ModuleKind::Button,
        ModuleKind::Light,
        ModuleKind::Buzzer,
        ModuleKind::Joystick,
        ModuleKind::Distance,
        ModuleKind::Qtr,
        ModuleKind::Servo,
        ModuleKind::Pot,
        ModuleKind::Rgb,
        ModuleKind::Imu,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ModuleKind::Button => "Button",
            ModuleKind::Light => "Light",
            ModuleKind::Buzzer => "Buzzer",
            ModuleKind::Joystick => "Joystick",
            ModuleKind::Distance => "Distance",
            ModuleKind::Qtr => "QTR",
            ModuleKind::Servo => "Servo",
            ModuleKind::Pot => "Pot",
            ModuleKind::Rgb => "RGB",
            ModuleKind::Imu => "IMU",
        }
    }

    /// First bit of this category in the connected bitfield
    pub fn anchor_bit(self) -> u32 {
        self as u32 * SLOTS_PER_KIND
    }

    /// Register that forces this category's slots in manual mode
    pub fn manual_register(self) -> Index {
        match self {
            ModuleKind::Button => Index::SetManualButton,
            ModuleKind::Light => Index::SetManualLight,
            ModuleKind::Buzzer => Index::SetManualBuzzer,
            ModuleKind::Joystick => Index::SetManualJoystick,
            ModuleKind::Distance => Index::SetManualDistance,
            ModuleKind::Qtr => Index::SetManualQtr,
            ModuleKind::Servo => Index::SetManualServo,
            ModuleKind::Pot => Index::SetManualPot,
            ModuleKind::Rgb => Index::SetManualRgb,
            ModuleKind::Imu => Index::SetManualImu,
        }
    }
}

impl FromStr for ModuleKind {
    type Err = SmdError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Potentiometer" => Ok(ModuleKind::Pot),
            _ => ModuleKind::ALL
                .into_iter()
                .find(|kind| kind.name() == s)
                .ok_or_else(|| SmdError::invalid_argument(format!("unknown module category '{}'", s))),
        }
    }
}

/// One module slot, written `<Category>_<slot>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId {
    pub kind: ModuleKind,
    /// 1..=5
    pub slot: u8,
}

impl ModuleId {
    pub fn new(kind: ModuleKind, slot: u8) -> Result<Self> {
        if !(1..=SLOTS_PER_KIND as u8).contains(&slot) {
            return Err(SmdError::invalid_argument(format!(
                "{} slot must be 1..={}, got {}",
                kind.name(),
                SLOTS_PER_KIND,
                slot
            )));
        }
        Ok(Self { kind, slot })
    }

    /// Position of this module in the connected bitfield
    pub fn bit(self) -> u32 {
        self.kind.anchor_bit() + u32::from(self.slot - 1)
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.kind.name(), self.slot)
    }
}

impl FromStr for ModuleId {
    type Err = SmdError;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, slot) = s.rsplit_once('_').ok_or_else(|| {
            SmdError::invalid_argument(format!("'{}' is not a module name, e.g. 'Button_2'", s))
        })?;
        let kind: ModuleKind = kind.parse()?;
        let slot: u8 = slot
            .parse()
            .map_err(|_| SmdError::invalid_argument(format!("'{}' has no valid slot number", s)))?;
        ModuleId::new(kind, slot)
    }
}

/// Modules present in a connected bitfield, by ascending bit
pub fn decode_bitfield(bitfield: u64) -> Vec<ModuleId> {
    let mut modules = Vec::new();
    for bit in 0..u64::BITS {
        if bitfield & (1u64 << bit) == 0 {
            continue;
        }
        let kind = ModuleKind::ALL.get((bit / SLOTS_PER_KIND) as usize);
        match kind {
            Some(&kind) => modules.push(ModuleId {
                kind,
                slot: (bit % SLOTS_PER_KIND) as u8 + 1,
            }),
            None => debug!("Reserved bitfield bit {} set", bit),
        }
    }
    modules
}

/// Per-category slot masks for manual module mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModuleMask {
    masks: [u8; KIND_COUNT],
}

impl ModuleMask {
    pub fn from_modules<'a>(modules: impl IntoIterator<Item = &'a ModuleId>) -> Self {
        let mut mask = Self::default();
        for module in modules {
            mask.masks[module.kind as usize] |= 1 << (module.slot - 1);
        }
        mask
    }

    /// Slot bits for `kind`; bit `n` is slot `n + 1`
    pub fn get(&self, kind: ModuleKind) -> u8 {
        self.masks[kind as usize]
    }
}

impl<T: Transport> Master<T> {
    /// Probe the module ports of `id` and report what is connected
    ///
    /// An empty list means the board answered but found nothing. Fails only
    /// when every bitfield poll went unanswered.
    pub fn scan_modules(&mut self, id: u8) -> Result<Vec<ModuleId>> {
        if id == crate::device::BROADCAST_ID {
            return Err(SmdError::invalid_argument("cannot scan with broadcast ID 255"));
        }
        self.check_target(id, false)?;

        self.send_verb(id, Command::ModuleScan)?;
        let settle = self.scan_settle;
        self.transport_mut().pause(settle);
        // The scan acknowledgment and any probe chatter are stale by now
        self.discard_stale_input()?;

        let mut bitfield = None;
        let mut last_error = None;
        for attempt in 1..=self.scan_retries {
            match self.get_variables(id, &[Index::ConnectedBitfieldLow, Index::ConnectedBitfieldHigh]) {
                Ok(values) => match values.as_slice() {
                    [RegisterValue::Word(low), RegisterValue::Word(high)] => {
                        let value = (u64::from(*high) << 32) | u64::from(*low);
                        bitfield = Some(value);
                        if value != 0 {
                            break;
                        }
                    },
                    _ => last_error = Some(SmdError::malformed("unexpected bitfield response")),
                },
                Err(e) if e.is_no_response() => {
                    debug!("Bitfield poll {}: {}", attempt, e);
                    last_error = Some(e);
                },
                Err(e) => return Err(e),
            }
        }

        let bitfield = match (bitfield, last_error) {
            (Some(bitfield), _) => bitfield,
            (None, Some(e)) => return Err(e),
            (None, None) => return Err(SmdError::malformed("no bitfield response")),
        };

        let modules = decode_bitfield(bitfield);
        if modules.is_empty() {
            info!("Device {}: no modules detected", id);
        } else {
            info!(
                "Device {}: modules {}",
                id,
                modules
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        Ok(modules)
    }

    /// Declare which modules are connected instead of probing for them
    ///
    /// Names are `<Category>_<1..5>`; duplicates are ignored. Every name is
    /// validated before anything is sent.
    pub fn set_connected_modules<S: AsRef<str>>(&mut self, id: u8, names: &[S]) -> Result<ModuleMask> {
        let modules = names
            .iter()
            .map(|name| name.as_ref().parse::<ModuleId>())
            .collect::<Result<BTreeSet<_>>>()?;
        self.check_target(id, true)?;

        let mask = ModuleMask::from_modules(&modules);
        debug!("Manual modules for device {}: {:?}", id, mask);

        self.write_one(id, Index::SetScanModuleMode, RegisterValue::Byte(1))?;
        let mut registers: Vec<(Index, u8)> = ModuleKind::ALL
            .iter()
            .map(|&kind| (kind.manual_register(), mask.get(kind)))
            .collect();
        registers.sort_by_key(|(index, _)| *index);
        for (index, bits) in registers {
            self.write_one(id, index, RegisterValue::Byte(bits))?;
        }
        self.send_verb(id, Command::ModuleScan)?;

        Ok(mask)
    }
}
