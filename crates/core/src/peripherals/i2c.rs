// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::i2c::command::{BusCommand, ControlFlags, ControlWordDecoder};
use crate::i2c::wire::{Reply, Request};
use crate::transport::BusLink;
use crate::{BusObserver, PeripheralTickResult, SimResult};
use std::any::Any;
use std::sync::Arc;

pub const PRERLO: u64 = 0x00;
pub const PRERHI: u64 = 0x04;
pub const CTR: u64 = 0x08;
/// Write: transmit register. Read: receive register.
pub const TXRX: u64 = 0x0C;
/// Write: command register. Read: status register.
pub const CRSR: u64 = 0x10;

pub const CTR_EN: u8 = 0x80;
pub const CTR_IEN: u8 = 0x40;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusFlags: u8 {
        /// NACK received on the last acknowledged command.
        const RXACK = 0x80;
        const BUSY = 0x40;
        const AL = 0x20;
        const TIP = 0x02;
        const IF = 0x01;
    }
}

/// Guest-visible I2C master (OpenCores-style register layout, 4-byte stride).
///
/// Control-word writes are decoded into bus commands and each one is sent
/// through the attached [`BusLink`]. Without a connected link the controller
/// answers locally: reads echo the last transmit byte, everything else is a
/// no-op, and nothing ever blocks.
#[derive(Debug, serde::Serialize)]
pub struct MasterBridge {
    prer: u16,
    ctr: u8,
    txr: u8,
    rxr: u8,
    sr: u8,
    #[serde(skip)]
    decoder: ControlWordDecoder,
    #[serde(skip)]
    link: Option<Box<dyn BusLink>>,
    #[serde(skip)]
    observers: Vec<Arc<dyn BusObserver>>,
}

impl Default for MasterBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl MasterBridge {
    pub fn new() -> Self {
        Self {
            prer: 0xFFFF,
            ctr: 0,
            txr: 0,
            rxr: 0,
            sr: 0,
            decoder: ControlWordDecoder::new(),
            link: None,
            observers: Vec::new(),
        }
    }

    pub fn with_link(link: Box<dyn BusLink>) -> Self {
        let mut bridge = Self::new();
        bridge.attach_link(link);
        bridge
    }

    pub fn attach_link(&mut self, link: Box<dyn BusLink>) {
        self.link = Some(link);
    }

    pub fn detach_link(&mut self) -> Option<Box<dyn BusLink>> {
        self.link.take()
    }

    pub fn link(&self) -> Option<&dyn BusLink> {
        self.link.as_deref()
    }

    pub fn link_mut(&mut self) -> Option<&mut (dyn BusLink + 'static)> {
        self.link.as_deref_mut()
    }

    pub fn add_observer(&mut self, observer: Arc<dyn BusObserver>) {
        self.observers.push(observer);
    }

    pub fn is_connected(&self) -> bool {
        self.link.as_ref().is_some_and(|l| l.is_connected())
    }

    pub fn status(&self) -> StatusFlags {
        StatusFlags::from_bits_truncate(self.sr)
    }

    pub fn rxr(&self) -> u8 {
        self.rxr
    }

    pub fn txr(&self) -> u8 {
        self.txr
    }

    /// Handle a guest write to the command register.
    pub fn on_control_write(&mut self, raw: u8) {
        if ControlFlags::from_bits_truncate(raw).contains(ControlFlags::IACK) {
            self.clear_status(StatusFlags::IF);
        }

        let commands = self.decoder.decode(raw, self.txr);
        if commands.is_empty() {
            return;
        }

        for cmd in commands {
            self.issue(cmd);
        }

        let busy = self.decoder.is_open();
        self.set_status(StatusFlags::BUSY, busy);
        self.clear_status(StatusFlags::TIP);
        self.set_status(StatusFlags::IF, true);
    }

    fn issue(&mut self, cmd: BusCommand) {
        for observer in &self.observers {
            observer.on_command(&cmd);
        }

        if !self.is_connected() {
            self.loopback(cmd);
            return;
        }
        let Some(link) = self.link.as_mut() else {
            return;
        };

        match link.round_trip(Request::from(cmd)) {
            Ok(reply) => {
                tracing::debug!("I2C: {:?} -> {:#04x}", cmd, reply.data());
                for observer in &self.observers {
                    observer.on_reply(&cmd, reply);
                }
                self.apply(cmd, reply);
            }
            Err(e) => {
                tracing::warn!(
                    "I2C: {} failed ({}), controller falls back to loopback",
                    cmd.name(),
                    e
                );
                link.disconnect();
                for observer in &self.observers {
                    observer.on_transport_error(&e);
                }
                // The guest sees a NACK and keeps whatever RXR held.
                self.set_status(StatusFlags::RXACK, true);
            }
        }
    }

    fn apply(&mut self, cmd: BusCommand, reply: Reply) {
        match cmd {
            BusCommand::ReadByte => self.rxr = reply.data(),
            _ => self.set_status(StatusFlags::RXACK, !reply.is_ack()),
        }
    }

    fn loopback(&mut self, cmd: BusCommand) {
        tracing::debug!("I2C: {:?} answered locally", cmd);
        for observer in &self.observers {
            observer.on_loopback(&cmd);
        }
        if cmd == BusCommand::ReadByte {
            self.rxr = self.txr;
        }
    }

    fn set_status(&mut self, flag: StatusFlags, on: bool) {
        let mut sr = self.status();
        sr.set(flag, on);
        self.sr = sr.bits();
    }

    fn clear_status(&mut self, flag: StatusFlags) {
        self.set_status(flag, false);
    }

    fn read_reg(&self, offset: u64) -> u8 {
        match offset {
            PRERLO => (self.prer & 0xFF) as u8,
            PRERHI => (self.prer >> 8) as u8,
            CTR => self.ctr,
            TXRX => self.rxr,
            CRSR => self.sr,
            _ => 0,
        }
    }

    fn write_reg(&mut self, offset: u64, value: u8) {
        match offset {
            PRERLO => self.prer = (self.prer & 0xFF00) | value as u16,
            PRERHI => self.prer = (self.prer & 0x00FF) | ((value as u16) << 8),
            CTR => self.ctr = value & (CTR_EN | CTR_IEN),
            TXRX => self.txr = value,
            CRSR => self.on_control_write(value),
            _ => {}
        }
    }
}

impl crate::Peripheral for MasterBridge {
    fn read(&self, offset: u64) -> SimResult<u8> {
        let reg_offset = offset & !3;
        // 8-bit registers on a 32-bit stride; upper lanes read as zero.
        if offset % 4 == 0 {
            Ok(self.read_reg(reg_offset))
        } else {
            Ok(0)
        }
    }

    fn write(&mut self, offset: u64, value: u8) -> SimResult<()> {
        if offset % 4 == 0 {
            self.write_reg(offset, value);
        }
        Ok(())
    }

    fn tick(&mut self) -> PeripheralTickResult {
        PeripheralTickResult {
            irq: self.ctr & CTR_IEN != 0 && self.status().contains(StatusFlags::IF),
            cycles: 0,
        }
    }

    fn as_any(&self) -> Option<&dyn Any> {
        Some(self)
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        Some(self)
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::i2c::registry::{DeviceRegisterFile, DeviceRegistry};
    use crate::i2c::state_machine::{PeripheralState, PeripheralStateMachine};
    use crate::transport::{InProcessLink, TransportError};
    use crate::Peripheral;
    use std::time::{Duration, Instant};

    const STA: u8 = 0x80;
    const STO: u8 = 0x40;
    const RD: u8 = 0x20;
    const WR: u8 = 0x10;
    const ACK: u8 = 0x08;
    const IACK: u8 = 0x01;

    fn eeprom_link() -> InProcessLink {
        let mut registry = DeviceRegistry::new();
        registry
            .attach(0x50, DeviceRegisterFile::named("eeprom"))
            .unwrap();
        InProcessLink::new(PeripheralStateMachine::new(registry))
    }

    fn machine(bridge: &MasterBridge) -> &PeripheralStateMachine {
        bridge
            .link()
            .and_then(|l| l.as_any())
            .and_then(|a| a.downcast_ref::<InProcessLink>())
            .map(|l| l.machine())
            .expect("bridge has no in-process link")
    }

    /// Fails every round trip after the first `budget` ones.
    #[derive(Debug)]
    struct FlakyLink {
        inner: InProcessLink,
        budget: usize,
    }

    impl BusLink for FlakyLink {
        fn is_connected(&self) -> bool {
            self.inner.is_connected()
        }

        fn round_trip(&mut self, request: Request) -> Result<Reply, TransportError> {
            if self.budget == 0 {
                return Err(TransportError::Closed);
            }
            self.budget -= 1;
            self.inner.round_trip(request)
        }

        fn disconnect(&mut self) {
            self.inner.disconnect();
        }
    }

    #[test]
    fn test_reset_values() {
        let bridge = MasterBridge::new();
        assert_eq!(bridge.read(PRERLO).unwrap(), 0xFF);
        assert_eq!(bridge.read(PRERHI).unwrap(), 0xFF);
        assert_eq!(bridge.read(CTR).unwrap(), 0);
        assert_eq!(bridge.read(CRSR).unwrap(), 0);
    }

    #[test]
    fn test_loopback_read_echoes_txr() {
        let mut bridge = MasterBridge::new();
        bridge.write(TXRX, 0x5A).unwrap();

        let started = Instant::now();
        bridge.write(CRSR, STA).unwrap();
        bridge.write(CRSR, RD).unwrap();
        assert!(started.elapsed() < Duration::from_millis(100));

        assert_eq!(bridge.read(TXRX).unwrap(), 0x5A);
        assert!(bridge.status().contains(StatusFlags::BUSY));
    }

    #[test]
    fn test_bare_read_on_fresh_controller_echoes_txr() {
        let mut bridge = MasterBridge::new();
        bridge.write(TXRX, 0x5A).unwrap();
        bridge.write(CRSR, RD).unwrap();

        assert_eq!(bridge.read(TXRX).unwrap(), 0x5A);
        assert!(!bridge.status().contains(StatusFlags::BUSY));
        assert!(bridge.status().contains(StatusFlags::IF));
    }

    #[test]
    fn test_write_transaction_through_registers() {
        let mut bridge = MasterBridge::with_link(Box::new(eeprom_link()));

        bridge.write(TXRX, 0x50 << 1).unwrap();
        bridge.write(CRSR, STA | WR).unwrap();
        assert!(!bridge.status().contains(StatusFlags::RXACK));

        bridge.write(TXRX, 0x10).unwrap();
        bridge.write(CRSR, WR).unwrap();
        bridge.write(TXRX, 0xAB).unwrap();
        bridge.write(CRSR, WR | STO).unwrap();

        assert!(!bridge.status().contains(StatusFlags::BUSY));
        let m = machine(&bridge);
        assert_eq!(m.state(), PeripheralState::Idle);
        let dev = m.registry().get(0x50).unwrap();
        assert_eq!(dev.read(0x10), 0xAB);
        assert_eq!(dev.pointer(), 0x11);
    }

    #[test]
    fn test_read_transaction_through_registers() {
        let mut link = eeprom_link();
        {
            let dev = link.machine_mut().registry_mut().get_mut(0x50).unwrap();
            dev.write(0x00, 0x11);
            dev.write(0x01, 0x22);
        }
        let mut bridge = MasterBridge::with_link(Box::new(link));

        bridge.write(TXRX, (0x50 << 1) | 1).unwrap();
        bridge.write(CRSR, STA | WR).unwrap();
        bridge.write(CRSR, RD | ACK).unwrap();
        assert_eq!(bridge.read(TXRX).unwrap(), 0x11);
        bridge.write(CRSR, RD | STO).unwrap();
        assert_eq!(bridge.read(TXRX).unwrap(), 0x22);

        assert_eq!(machine(&bridge).state(), PeripheralState::Idle);
    }

    #[test]
    fn test_absent_device_sets_rxack() {
        let mut bridge = MasterBridge::with_link(Box::new(eeprom_link()));
        bridge.write(TXRX, 0x3C << 1).unwrap();
        bridge.write(CRSR, STA | WR).unwrap();
        assert!(bridge.status().contains(StatusFlags::RXACK));
    }

    #[test]
    fn test_start_and_stop_together_leave_bus_idle() {
        let mut bridge = MasterBridge::with_link(Box::new(eeprom_link()));
        bridge.write(CRSR, STA | STO).unwrap();
        assert!(!bridge.status().contains(StatusFlags::BUSY));
        assert_eq!(machine(&bridge).state(), PeripheralState::Idle);
    }

    #[test]
    fn test_transport_error_falls_back_to_loopback() {
        let mut bridge = MasterBridge::with_link(Box::new(FlakyLink {
            inner: eeprom_link(),
            budget: 1,
        }));

        bridge.write(TXRX, 0x50 << 1).unwrap();
        bridge.write(CRSR, STA).unwrap();
        assert!(bridge.is_connected());

        // Second round trip fails: NACK, link dropped.
        bridge.write(CRSR, WR).unwrap();
        assert!(bridge.status().contains(StatusFlags::RXACK));
        assert!(!bridge.is_connected());

        bridge.write(TXRX, 0x77).unwrap();
        bridge.write(CRSR, RD).unwrap();
        assert_eq!(bridge.read(TXRX).unwrap(), 0x77);
    }

    #[test]
    fn test_interrupt_flag_and_ack() {
        let mut bridge = MasterBridge::new();
        bridge.write(CTR, CTR_EN | CTR_IEN).unwrap();
        assert!(!bridge.tick().irq);

        bridge.write(CRSR, STA).unwrap();
        assert!(bridge.status().contains(StatusFlags::IF));
        assert!(bridge.tick().irq);

        bridge.write(CRSR, IACK).unwrap();
        assert!(!bridge.status().contains(StatusFlags::IF));
        assert!(!bridge.tick().irq);
    }

    #[test]
    fn test_upper_byte_lanes_ignored() {
        let mut bridge = MasterBridge::new();
        bridge.write(TXRX + 1, 0xEE).unwrap();
        assert_eq!(bridge.txr(), 0);
        assert_eq!(bridge.read(PRERLO + 2).unwrap(), 0);

        bridge.write(PRERHI, 0x12).unwrap();
        bridge.write(PRERLO, 0x34).unwrap();
        assert_eq!(bridge.snapshot()["prer"], 0x1234);
    }
}
