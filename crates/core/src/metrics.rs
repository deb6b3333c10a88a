// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::i2c::command::BusCommand;
use crate::i2c::state_machine::PeripheralState;
use crate::i2c::wire::{Reply, Request, WireError, REQUEST_LEN};
use crate::transport::TransportError;
use crate::BusObserver;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct BridgeMetrics {
    commands: AtomicU64,
    round_trips: AtomicU64,
    nacks: AtomicU64,
    loopbacks: AtomicU64,
    transport_errors: AtomicU64,
    desyncs: AtomicU64,
    commands_by_name: Mutex<HashMap<&'static str, u64>>,
}

impl BridgeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        self.commands.store(0, Ordering::SeqCst);
        self.round_trips.store(0, Ordering::SeqCst);
        self.nacks.store(0, Ordering::SeqCst);
        self.loopbacks.store(0, Ordering::SeqCst);
        self.transport_errors.store(0, Ordering::SeqCst);
        self.desyncs.store(0, Ordering::SeqCst);
        if let Ok(mut m) = self.commands_by_name.lock() {
            m.clear();
        }
    }

    pub fn get_commands(&self) -> u64 {
        self.commands.load(Ordering::SeqCst)
    }

    pub fn get_round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::SeqCst)
    }

    pub fn get_nacks(&self) -> u64 {
        self.nacks.load(Ordering::SeqCst)
    }

    pub fn get_loopbacks(&self) -> u64 {
        self.loopbacks.load(Ordering::SeqCst)
    }

    pub fn get_transport_errors(&self) -> u64 {
        self.transport_errors.load(Ordering::SeqCst)
    }

    pub fn get_desyncs(&self) -> u64 {
        self.desyncs.load(Ordering::SeqCst)
    }

    pub fn get_commands_named(&self, name: &str) -> u64 {
        self.commands_by_name
            .lock()
            .ok()
            .and_then(|m| m.get(name).copied())
            .unwrap_or(0)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "commands": self.get_commands(),
            "round_trips": self.get_round_trips(),
            "nacks": self.get_nacks(),
            "loopbacks": self.get_loopbacks(),
            "transport_errors": self.get_transport_errors(),
            "desyncs": self.get_desyncs(),
        })
    }
}

impl BusObserver for BridgeMetrics {
    fn on_command(&self, command: &BusCommand) {
        self.commands.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut m) = self.commands_by_name.lock() {
            *m.entry(command.name()).or_insert(0) += 1;
        }
    }

    fn on_reply(&self, command: &BusCommand, reply: Reply) {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        if *command != BusCommand::ReadByte && !reply.is_ack() {
            self.nacks.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn on_loopback(&self, _command: &BusCommand) {
        self.loopbacks.fetch_add(1, Ordering::SeqCst);
    }

    fn on_transport_error(&self, _error: &TransportError) {
        self.transport_errors.fetch_add(1, Ordering::SeqCst);
    }

    fn on_desync(&self, _state: PeripheralState, _request: &Request) {
        self.desyncs.fetch_add(1, Ordering::SeqCst);
    }

    fn on_bad_frame(
        &self,
        _state: PeripheralState,
        _frame: [u8; REQUEST_LEN],
        _error: &WireError,
    ) {
        self.desyncs.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::i2c::registry::DeviceRegistry;
    use crate::i2c::state_machine::PeripheralStateMachine;
    use crate::peripherals::i2c::{MasterBridge, CRSR, TXRX};
    use crate::transport::InProcessLink;
    use crate::Peripheral;
    use std::sync::Arc;

    #[test]
    fn test_counts_loopback_commands() {
        let metrics = Arc::new(BridgeMetrics::new());
        let mut bridge = MasterBridge::new();
        bridge.add_observer(metrics.clone());

        bridge.write(CRSR, 0x80 | 0x40).unwrap(); // START | STOP
        assert_eq!(metrics.get_commands(), 2);
        assert_eq!(metrics.get_loopbacks(), 2);
        assert_eq!(metrics.get_round_trips(), 0);
        assert_eq!(metrics.get_commands_named("START"), 1);
    }

    #[test]
    fn test_counts_nacks_and_desyncs() {
        let metrics = Arc::new(BridgeMetrics::new());
        let mut machine = PeripheralStateMachine::new(DeviceRegistry::new());
        machine.add_observer(metrics.clone());
        let mut bridge = MasterBridge::with_link(Box::new(InProcessLink::new(machine)));
        bridge.add_observer(metrics.clone());

        // No device at 0x50: the address byte is refused.
        bridge.write(TXRX, 0xA0).unwrap();
        bridge.write(CRSR, 0x80 | 0x10).unwrap();
        assert_eq!(metrics.get_round_trips(), 2);
        assert_eq!(metrics.get_nacks(), 1);

        // Peer went back to Idle, so further data is out of sequence.
        bridge.write(CRSR, 0x10).unwrap();
        assert_eq!(metrics.get_desyncs(), 1);
        assert_eq!(metrics.to_json()["nacks"], 2);

        metrics.reset();
        assert_eq!(metrics.get_commands(), 0);
    }

    #[test]
    fn test_undecodable_frame_counts_as_desync() {
        let metrics = Arc::new(BridgeMetrics::new());
        let mut machine = PeripheralStateMachine::new(DeviceRegistry::new());
        machine.add_observer(metrics.clone());

        machine.handle_frame([0x03, 0x00]);
        machine.handle(Request::from(BusCommand::ReadByte));

        assert_eq!(machine.desync_count(), 2);
        assert_eq!(metrics.get_desyncs(), machine.desync_count());
    }
}
