//! Device records and the per-ID slot table

use crate::error::{Result, SmdError};
use crate::registry::Registry;

/// Reserved broadcast address
pub const BROADCAST_ID: u8 = 255;

/// Highest individually addressable ID
pub const MAX_DEVICE_ID: u8 = 254;

/// One Red board on the bus
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    id: u8,
    registry: Registry,
}

impl Device {
    /// Create a record for an addressable device
    pub fn new(id: u8) -> Result<Self> {
        if id > MAX_DEVICE_ID {
            return Err(SmdError::invalid_argument(format!(
                "device ID must be 0..={}, got {}",
                MAX_DEVICE_ID, id
            )));
        }
        Ok(Self {
            id,
            registry: Registry::new(id),
        })
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }
}

/// Fixed arena of 256 slots addressed by device ID
#[derive(Debug, Clone)]
pub struct DeviceTable {
    slots: Vec<Option<Device>>,
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceTable {
    pub fn new() -> Self {
        Self {
            slots: vec![None; BROADCAST_ID as usize + 1],
        }
    }

    /// Place `device` in its slot, returning whatever was there
    pub fn attach(&mut self, device: Device) -> Option<Device> {
        let slot = device.id() as usize;
        self.slots[slot].replace(device)
    }

    /// Empty the slot for `id`
    pub fn detach(&mut self, id: u8) -> Option<Device> {
        self.slots[id as usize].take()
    }

    /// Attached iff the slot holds a registry whose device ID equals the slot
    pub fn is_attached(&self, id: u8) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: u8) -> Option<&Device> {
        self.slots[id as usize]
            .as_ref()
            .filter(|d| d.registry().device_id() == Some(id))
    }

    pub fn get_mut(&mut self, id: u8) -> Option<&mut Device> {
        self.slots[id as usize]
            .as_mut()
            .filter(|d| d.registry().device_id() == Some(id))
    }

    /// Attached IDs in ascending order
    pub fn attached(&self) -> Vec<u8> {
        (0..=MAX_DEVICE_ID).filter(|&id| self.is_attached(id)).collect()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::registry::{Index, RegisterValue};

    #[test]
    fn test_device_id_range() {
        assert!(Device::new(0).is_ok());
        assert!(Device::new(254).is_ok());
        assert!(matches!(
            Device::new(BROADCAST_ID),
            Err(SmdError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_attach_detach() {
        let mut table = DeviceTable::new();
        assert!(!table.is_attached(3));

        assert!(table.attach(Device::new(3).unwrap()).is_none());
        assert!(table.is_attached(3));
        assert_eq!(table.attached(), vec![3]);

        assert!(table.attach(Device::new(3).unwrap()).is_some());
        table.attach(Device::new(1).unwrap());
        assert_eq!(table.attached(), vec![1, 3]);

        assert!(table.detach(3).is_some());
        assert!(!table.is_attached(3));
        assert!(table.detach(3).is_none());
        assert!(!table.is_attached(BROADCAST_ID));
    }

    #[test]
    fn test_registry_id_must_match_slot() {
        let mut table = DeviceTable::new();
        table.attach(Device::new(8).unwrap());
        table
            .get_mut(8)
            .unwrap()
            .registry_mut()
            .set(Index::DeviceId, RegisterValue::Byte(9))
            .unwrap();
        assert!(!table.is_attached(8));
        assert!(table.get(8).is_none());
    }
}
