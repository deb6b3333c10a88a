// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::config::TransportConfig;
use crate::peripherals::i2c::MasterBridge;
use crate::transport::MasterSession;
use crate::{Peripheral, SimResult, SimulationError};
use anyhow::Context;
use labwired_config::BusManifest;

pub struct PeripheralEntry {
    pub name: String,
    pub base: u64,
    pub size: u64,
    pub irq: Option<u32>,
    pub dev: Box<dyn Peripheral>,
}

impl PeripheralEntry {
    /// Offset of `addr` inside this window, if it falls there.
    pub fn offset_of(&self, addr: u64) -> Option<u64> {
        addr.checked_sub(self.base).filter(|off| *off < self.size)
    }
}

/// Routes guest register accesses to memory-mapped peripherals.
#[derive(Default)]
pub struct SystemBus {
    pub peripherals: Vec<PeripheralEntry>,
}

impl SystemBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peripheral(
        &mut self,
        name: impl Into<String>,
        base: u64,
        size: u64,
        irq: Option<u32>,
        dev: Box<dyn Peripheral>,
    ) {
        self.peripherals.push(PeripheralEntry {
            name: name.into(),
            base,
            size,
            irq,
            dev,
        });
    }

    /// Build one I2C controller per manifest entry. Controllers with a `peer`
    /// get a socket session that connects in the background; the others stay
    /// in loopback.
    pub fn from_config(manifest: &BusManifest) -> anyhow::Result<Self> {
        let mut bus = Self::new();

        for ctrl in &manifest.controllers {
            let mut bridge = MasterBridge::new();
            if let Some(transport) = TransportConfig::from_controller(ctrl) {
                let endpoint = transport.endpoint.clone();
                let session = MasterSession::connect(transport).with_context(|| {
                    format!(
                        "Failed to start I2C link for '{}' to '{}'",
                        ctrl.id, endpoint
                    )
                })?;
                tracing::info!("Controller {} linked to peer {}", ctrl.id, endpoint);
                bridge.attach_link(Box::new(session));
            } else {
                tracing::info!("Controller {} has no peer; running in loopback", ctrl.id);
            }

            let size = ctrl.window_size()?;

            bus.add_peripheral(
                ctrl.id.clone(),
                ctrl.base_address,
                size,
                ctrl.irq,
                Box::new(bridge),
            );
        }

        Ok(bus)
    }

    pub fn find(&self, name: &str) -> Option<&PeripheralEntry> {
        self.peripherals.iter().find(|p| p.name == name)
    }

    pub fn bridge(&self, name: &str) -> Option<&MasterBridge> {
        self.find(name)?.dev.as_any()?.downcast_ref::<MasterBridge>()
    }

    pub fn bridge_mut(&mut self, name: &str) -> Option<&mut MasterBridge> {
        self.peripherals
            .iter_mut()
            .find(|p| p.name == name)?
            .dev
            .as_any_mut()?
            .downcast_mut::<MasterBridge>()
    }

    pub fn peek_peripheral(&self, name: &str) -> Option<serde_json::Value> {
        self.find(name).map(|p| p.dev.snapshot())
    }
}

impl crate::Bus for SystemBus {
    fn read_u8(&self, addr: u64) -> SimResult<u8> {
        for p in &self.peripherals {
            if let Some(offset) = p.offset_of(addr) {
                return p.dev.read(offset);
            }
        }
        Err(SimulationError::MemoryViolation(addr))
    }

    fn write_u8(&mut self, addr: u64, value: u8) -> SimResult<()> {
        for p in &mut self.peripherals {
            if let Some(offset) = p.offset_of(addr) {
                return p.dev.write(offset, value);
            }
        }
        Err(SimulationError::MemoryViolation(addr))
    }

    fn tick_peripherals(&mut self) -> Vec<u32> {
        let mut interrupts = Vec::new();
        for p in &mut self.peripherals {
            let res = p.dev.tick();
            if res.irq {
                if let Some(irq) = p.irq {
                    interrupts.push(irq);
                }
            }
        }
        interrupts
    }
}
