//! Add-on module accessors
//!
//! Each category has five slots, numbered 1 to 5, mapped onto consecutive
//! registers. A slot outside that range is an [`SmdError::InvalidIndex`].

use super::Master;
use crate::error::{Result, SmdError};
use crate::registry::{Index, RegisterValue};
use crate::transport::Transport;

/// Slots per module category
pub const MODULE_SLOTS: u8 = 5;

/// Colour for an RGB module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rgb {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl Rgb {
    pub const fn new(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue }
    }

    /// Build from wider integers, rejecting channels outside 0..=255
    pub fn try_new(red: i32, green: i32, blue: i32) -> Result<Self> {
        let channel = |name: &str, value: i32| {
            u8::try_from(value).map_err(|_| {
                SmdError::invalid_argument(format!(
                    "{} channel must be in [0, 255], got {}",
                    name, value
                ))
            })
        };
        Ok(Self {
            red: channel("red", red)?,
            green: channel("green", green)?,
            blue: channel("blue", blue)?,
        })
    }

    /// Register encoding: red in the low byte, then green, then blue
    pub fn packed(self) -> i32 {
        i32::from(self.red) | (i32::from(self.green) << 8) | (i32::from(self.blue) << 16)
    }
}

fn slot_index(first: Index, slot: u8, module: &str) -> Result<Index> {
    if !(1..=MODULE_SLOTS).contains(&slot) {
        return Err(SmdError::invalid_index(format!(
            "{} slot must be 1..={}, got {}",
            module, MODULE_SLOTS, slot
        )));
    }
    first
        .offset(usize::from(slot - 1))
        .ok_or_else(|| SmdError::invalid_index(format!("no register for {} {}", module, slot)))
}

impl<T: Transport> Master<T> {
    /// True while the button is pressed
    pub fn get_button(&mut self, id: u8, slot: u8) -> Result<bool> {
        let index = slot_index(Index::Button1, slot, "button")?;
        Ok(self.read_as(id, index, RegisterValue::as_u8)? != 0)
    }

    /// Ambient light level
    pub fn get_light(&mut self, id: u8, slot: u8) -> Result<u16> {
        let index = slot_index(Index::Light1, slot, "light")?;
        self.read_as(id, index, RegisterValue::as_u16)
    }

    /// Play a tone; zero silences the buzzer
    pub fn set_buzzer(&mut self, id: u8, slot: u8, frequency: u32) -> Result<()> {
        let frequency = i32::try_from(frequency).map_err(|_| {
            SmdError::invalid_argument(format!("note frequency {} out of range", frequency))
        })?;
        let index = slot_index(Index::Buzzer1, slot, "buzzer")?;
        self.write_one(id, index, RegisterValue::SignedWord(frequency))
    }

    /// Raw joystick word
    pub fn get_joystick(&mut self, id: u8, slot: u8) -> Result<i32> {
        let index = slot_index(Index::Joystick1, slot, "joystick")?;
        self.read_as(id, index, RegisterValue::as_i32)
    }

    pub fn get_distance(&mut self, id: u8, slot: u8) -> Result<u16> {
        let index = slot_index(Index::Distance1, slot, "distance")?;
        self.read_as(id, index, RegisterValue::as_u16)
    }

    /// Left, middle and right line sensor states
    pub fn get_qtr(&mut self, id: u8, slot: u8) -> Result<[bool; 3]> {
        let index = slot_index(Index::Qtr1, slot, "QTR")?;
        let raw = self.read_as(id, index, RegisterValue::as_i32)?;
        Ok([raw & 0b001 != 0, raw & 0b010 != 0, raw & 0b100 != 0])
    }

    /// Servo angle command, 0..=255
    pub fn set_servo(&mut self, id: u8, slot: u8, value: u8) -> Result<()> {
        let index = slot_index(Index::Servo1, slot, "servo")?;
        self.write_one(id, index, RegisterValue::Byte(value))
    }

    pub fn get_potentiometer(&mut self, id: u8, slot: u8) -> Result<u8> {
        let index = slot_index(Index::Pot1, slot, "potentiometer")?;
        self.read_as(id, index, RegisterValue::as_u8)
    }

    pub fn set_rgb(&mut self, id: u8, slot: u8, color: Rgb) -> Result<()> {
        let index = slot_index(Index::Rgb1, slot, "RGB")?;
        self.write_one(id, index, RegisterValue::SignedWord(color.packed()))
    }

    pub fn get_imu(&mut self, id: u8, slot: u8) -> Result<f32> {
        let index = slot_index(Index::Imu1, slot, "IMU")?;
        self.read_as(id, index, RegisterValue::as_f32)
    }
}
