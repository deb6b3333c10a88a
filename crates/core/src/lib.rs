// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

pub mod bus;
pub mod config;
pub mod i2c;
pub mod metrics;
pub mod peripherals;
pub mod transport;

use std::any::Any;


pub use i2c::command::{BusCommand, ControlFlags, ControlWordDecoder};
pub use i2c::registry::{DeviceRegisterFile, DeviceRegistry};
pub use i2c::state_machine::{PeripheralState, PeripheralStateMachine};
pub use i2c::wire::{Reply, Request, Selector, WireError};
pub use peripherals::i2c::MasterBridge;
pub use transport::{BusLink, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("Memory access violation at {0:#x}")]
    MemoryViolation(u64),
}

pub type SimResult<T> = Result<T, SimulationError>;

#[derive(Debug, Clone, Default)]
pub struct PeripheralTickResult {
    pub irq: bool,
    pub cycles: u32,
}

/// Trait for observing I2C bus traffic in a modular way.
///
/// Hooks are called from whichever thread drives the observed component, so
/// implementations must be thread safe.
pub trait BusObserver: std::fmt::Debug + Send + Sync {
    fn on_command(&self, _command: &BusCommand) {}
    fn on_reply(&self, _command: &BusCommand, _reply: Reply) {}
    fn on_loopback(&self, _command: &BusCommand) {}
    fn on_transport_error(&self, _error: &TransportError) {}
    fn on_desync(&self, _state: PeripheralState, _request: &Request) {}
    /// A frame the peer could not decode at all. Counted as a desync too.
    fn on_bad_frame(
        &self,
        _state: PeripheralState,
        _frame: [u8; i2c::wire::REQUEST_LEN],
        _error: &WireError,
    ) {
    }
}

/// Trait representing a memory-mapped peripheral
pub trait Peripheral: std::fmt::Debug + Send {
    fn read(&self, offset: u64) -> SimResult<u8>;
    fn write(&mut self, offset: u64, value: u8) -> SimResult<()>;
    fn tick(&mut self) -> PeripheralTickResult {
        PeripheralTickResult::default()
    }
    fn as_any(&self) -> Option<&dyn Any> {
        None
    }
    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        None
    }
    fn snapshot(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// Trait representing the register bus the guest CPU talks to
pub trait Bus {
    fn read_u8(&self, addr: u64) -> SimResult<u8>;
    fn write_u8(&mut self, addr: u64, value: u8) -> SimResult<()>;
    fn tick_peripherals(&mut self) -> Vec<u32>; // Returns list of pending IRQ numbers

    fn read_u32(&self, addr: u64) -> SimResult<u32> {
        let b0 = self.read_u8(addr)? as u32;
        let b1 = self.read_u8(addr + 1)? as u32;
        let b2 = self.read_u8(addr + 2)? as u32;
        let b3 = self.read_u8(addr + 3)? as u32;
        Ok(b0 | (b1 << 8) | (b2 << 16) | (b3 << 24))
    }

    fn write_u32(&mut self, addr: u64, value: u32) -> SimResult<()> {
        self.write_u8(addr, (value & 0xFF) as u8)?;
        self.write_u8(addr + 1, ((value >> 8) & 0xFF) as u8)?;
        self.write_u8(addr + 2, ((value >> 16) & 0xFF) as u8)?;
        self.write_u8(addr + 3, ((value >> 24) & 0xFF) as u8)?;
        Ok(())
    }
}
