// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use super::command::BusCommand;
use super::registry::{DeviceRegisterFile, DeviceRegistry};
use super::wire::{Reply, Request, IDLE_BUS, REQUEST_LEN};
use crate::BusObserver;
use std::sync::Arc;

/// Bus phase as seen by the addressed target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeripheralState {
    #[default]
    Idle,
    /// START seen, waiting for the address byte.
    Address,
    /// Addressed for writing, waiting for the register pointer.
    Register,
    /// Reading sequentially from the pointer.
    Read,
    /// Writing sequentially at the pointer.
    Write,
}

/// Peer-side decoder: replays wire requests as I2C bus phases against a
/// [`DeviceRegistry`] and produces the one-byte replies.
///
/// The registry is owned here; whichever thread drives the machine is the
/// only one touching device registers.
#[derive(Debug, Default)]
pub struct PeripheralStateMachine {
    state: PeripheralState,
    device: Option<u8>,
    registry: DeviceRegistry,
    desyncs: u64,
    observers: Vec<Arc<dyn BusObserver>>,
}

impl PeripheralStateMachine {
    pub fn new(registry: DeviceRegistry) -> Self {
        Self {
            registry,
            ..Self::default()
        }
    }

    pub fn add_observer(&mut self, observer: Arc<dyn BusObserver>) {
        self.observers.push(observer);
    }

    pub fn state(&self) -> PeripheralState {
        self.state
    }

    /// Device id selected by the current transaction, if any.
    pub fn device(&self) -> Option<u8> {
        self.device
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut DeviceRegistry {
        &mut self.registry
    }

    pub fn into_registry(self) -> DeviceRegistry {
        self.registry
    }

    pub fn desync_count(&self) -> u64 {
        self.desyncs
    }

    /// Forget any half-finished transaction. Device registers are untouched.
    pub fn reset(&mut self) {
        self.state = PeripheralState::Idle;
        self.device = None;
    }

    /// Decode and handle one raw request frame.
    pub fn handle_frame(&mut self, frame: [u8; REQUEST_LEN]) -> Reply {
        match Request::decode(frame) {
            Ok(request) => self.handle(request),
            Err(e) => {
                self.desyncs += 1;
                tracing::warn!("I2C peer: {} in state {:?}", e, self.state);
                for observer in &self.observers {
                    observer.on_bad_frame(self.state, frame, &e);
                }
                Reply::nack()
            }
        }
    }

    pub fn handle(&mut self, request: Request) -> Reply {
        let command = request.command();
        let before = self.state;

        let reply = match command {
            // STOP always wins, including the no-op STOP in Idle.
            BusCommand::Stop => {
                self.reset();
                Reply::ack()
            }
            BusCommand::Start => {
                self.state = PeripheralState::Address;
                self.device = None;
                Reply::ack()
            }
            _ => self.transfer(command, &request),
        };

        tracing::debug!(
            "I2C peer: {:?} {:?} -> {:?} reply {:#04x}",
            before,
            command,
            self.state,
            reply.data()
        );
        reply
    }

    fn transfer(&mut self, command: BusCommand, request: &Request) -> Reply {
        match (self.state, command) {
            (PeripheralState::Address, BusCommand::WriteByte(byte)) => self.select(byte),
            (PeripheralState::Register, BusCommand::WriteByte(pointer)) => {
                match self.selected_mut() {
                    Some(dev) => {
                        dev.set_pointer(pointer);
                        self.state = PeripheralState::Write;
                        Reply::ack()
                    }
                    None => self.desync(request),
                }
            }
            (PeripheralState::Write, BusCommand::WriteByte(value)) => match self.selected_mut() {
                Some(dev) => {
                    dev.write_next(value);
                    Reply::ack()
                }
                None => self.desync(request),
            },
            (PeripheralState::Read, BusCommand::ReadByte) => match self.selected_mut() {
                Some(dev) => Reply(dev.read_next()),
                None => self.desync(request),
            },
            (PeripheralState::Read, BusCommand::Ack(true)) => Reply::ack(),
            (PeripheralState::Read, BusCommand::Ack(false)) => {
                // Master wants no more bytes.
                self.reset();
                Reply::ack()
            }
            _ => self.desync(request),
        }
    }

    fn select(&mut self, address_byte: u8) -> Reply {
        let id = address_byte >> 1;
        let read = address_byte & 1 != 0;

        if !self.registry.contains(id) {
            tracing::debug!("I2C peer: no device at {:#04x}, NACK", id);
            self.reset();
            return Reply::nack();
        }

        self.device = Some(id);
        self.state = if read {
            PeripheralState::Read
        } else {
            PeripheralState::Register
        };
        Reply::ack()
    }

    fn selected_mut(&mut self) -> Option<&mut DeviceRegisterFile> {
        let id = self.device?;
        self.registry.get_mut(id)
    }

    fn desync(&mut self, request: &Request) -> Reply {
        self.desyncs += 1;
        tracing::warn!(
            "I2C peer: unexpected {:?} in state {:?}, ignoring",
            request.command(),
            self.state
        );
        for observer in &self.observers {
            observer.on_desync(self.state, request);
        }
        match request.command() {
            BusCommand::ReadByte => Reply(IDLE_BUS),
            _ => Reply::nack(),
        }
    }
}
