// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use super::MAX_DEVICE_ID;
use labwired_config::DeviceConfig;
use std::collections::BTreeMap;

const REGISTER_COUNT: usize = 256;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("device address {0:#04x} does not fit in 7 bits")]
    InvalidAddress(u8),
    #[error("device address {0:#04x} is already attached")]
    Duplicate(u8),
}

/// Register file of one simulated I2C target: 256 byte registers plus the
/// auto-incrementing register pointer.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeviceRegisterFile {
    pub name: Option<String>,
    pointer: u8,
    registers: Vec<u8>,
}

impl Default for DeviceRegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegisterFile {
    pub fn new() -> Self {
        Self {
            name: None,
            pointer: 0,
            registers: vec![0; REGISTER_COUNT],
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new()
        }
    }

    pub fn with_registers(mut self, values: impl IntoIterator<Item = (u8, u8)>) -> Self {
        for (reg, value) in values {
            self.registers[reg as usize] = value;
        }
        self
    }

    pub fn read(&self, reg: u8) -> u8 {
        self.registers[reg as usize]
    }

    pub fn write(&mut self, reg: u8, value: u8) {
        self.registers[reg as usize] = value;
    }

    pub fn pointer(&self) -> u8 {
        self.pointer
    }

    pub fn set_pointer(&mut self, pointer: u8) {
        self.pointer = pointer;
    }

    /// Read at the pointer, then advance it (wrapping at 0xFF).
    pub fn read_next(&mut self) -> u8 {
        let value = self.read(self.pointer);
        self.pointer = self.pointer.wrapping_add(1);
        value
    }

    /// Write at the pointer, then advance it (wrapping at 0xFF).
    pub fn write_next(&mut self, value: u8) {
        self.write(self.pointer, value);
        self.pointer = self.pointer.wrapping_add(1);
    }

    pub fn registers(&self) -> &[u8] {
        &self.registers
    }
}

/// All targets reachable on one virtual bus, keyed by 7-bit address.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<u8, DeviceRegisterFile>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(devices: &[DeviceConfig]) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        for dev in devices {
            let mut file = match &dev.name {
                Some(name) => DeviceRegisterFile::named(name.clone()),
                None => DeviceRegisterFile::new(),
            };
            file = file.with_registers(dev.registers.iter().map(|(r, v)| (*r, *v)));
            registry.attach(dev.address, file)?;
            tracing::debug!("Attached I2C device {:#04x}", dev.address);
        }
        Ok(registry)
    }

    pub fn attach(&mut self, id: u8, file: DeviceRegisterFile) -> Result<(), RegistryError> {
        if id > MAX_DEVICE_ID {
            return Err(RegistryError::InvalidAddress(id));
        }
        if self.devices.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        self.devices.insert(id, file);
        Ok(())
    }

    pub fn detach(&mut self, id: u8) -> Option<DeviceRegisterFile> {
        self.devices.remove(&id)
    }

    pub fn contains(&self, id: u8) -> bool {
        self.devices.contains_key(&id)
    }

    pub fn get(&self, id: u8) -> Option<&DeviceRegisterFile> {
        self.devices.get(&id)
    }

    pub fn get_mut(&mut self, id: u8) -> Option<&mut DeviceRegisterFile> {
        self.devices.get_mut(&id)
    }

    pub fn ids(&self) -> Vec<u8> {
        self.devices.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// JSON copy of every device, keyed by `0x..` address.
    pub fn snapshot(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .devices
            .iter()
            .map(|(id, dev)| {
                (
                    format!("{:#04x}", id),
                    serde_json::to_value(dev).unwrap_or(serde_json::Value::Null),
                )
            })
            .collect();
        serde_json::Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_pointer_auto_increment_wraps() {
        let mut dev = DeviceRegisterFile::new();
        dev.set_pointer(0xFF);
        dev.write_next(0xAA);
        assert_eq!(dev.pointer(), 0x00);
        assert_eq!(dev.read(0xFF), 0xAA);

        dev.set_pointer(0xFF);
        assert_eq!(dev.read_next(), 0xAA);
        assert_eq!(dev.pointer(), 0x00);
    }

    #[test]
    fn test_attach_rejects_bad_addresses() {
        let mut registry = DeviceRegistry::new();
        assert_eq!(
            registry.attach(0x80, DeviceRegisterFile::new()),
            Err(RegistryError::InvalidAddress(0x80))
        );
        registry.attach(0x50, DeviceRegisterFile::new()).unwrap();
        assert_eq!(
            registry.attach(0x50, DeviceRegisterFile::new()),
            Err(RegistryError::Duplicate(0x50))
        );
        assert_eq!(registry.ids(), vec![0x50]);
    }

    #[test]
    fn test_from_config_seeds_registers() {
        let mut registers = BTreeMap::new();
        registers.insert(0x00, 0x12);
        registers.insert(0x01, 0x34);
        let devices = vec![DeviceConfig {
            address: 0x48,
            name: Some("tmp102".to_string()),
            registers,
        }];

        let registry = DeviceRegistry::from_config(&devices).unwrap();
        let dev = registry.get(0x48).unwrap();
        assert_eq!(dev.name.as_deref(), Some("tmp102"));
        assert_eq!(dev.read(0x00), 0x12);
        assert_eq!(dev.read(0x01), 0x34);
        assert_eq!(dev.read(0x02), 0x00);
    }

    #[test]
    fn test_snapshot_keys_by_address() {
        let mut registry = DeviceRegistry::new();
        registry
            .attach(0x50, DeviceRegisterFile::named("eeprom").with_registers([(3, 9)]))
            .unwrap();

        let snap = registry.snapshot();
        assert_eq!(snap["0x50"]["name"], "eeprom");
        assert_eq!(snap["0x50"]["pointer"], 0);
        assert_eq!(snap["0x50"]["registers"][3], 9);
    }
}
