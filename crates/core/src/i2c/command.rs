// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

bitflags::bitflags! {
    /// Command bits of the controller's CR register.
    ///
    /// Bits 0x04 and 0x02 are reserved and dropped by `from_bits_truncate`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ControlFlags: u8 {
        const START = 0x80;
        const STOP = 0x40;
        const READ = 0x20;
        const WRITE = 0x10;
        const ACK = 0x08;
        const IACK = 0x01;
    }
}

/// A single logical bus event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusCommand {
    Start,
    WriteByte(u8),
    ReadByte,
    Ack(bool),
    Stop,
}

impl BusCommand {
    /// Control-word bits that make the decoder emit this command. `Ack(false)`
    /// is implicit and has no bit.
    pub fn control_bits(&self) -> ControlFlags {
        match self {
            BusCommand::Start => ControlFlags::START,
            BusCommand::WriteByte(_) => ControlFlags::WRITE,
            BusCommand::ReadByte => ControlFlags::READ,
            BusCommand::Ack(true) => ControlFlags::ACK,
            BusCommand::Ack(false) => ControlFlags::empty(),
            BusCommand::Stop => ControlFlags::STOP,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BusCommand::Start => "START",
            BusCommand::WriteByte(_) => "WRITE",
            BusCommand::ReadByte => "READ",
            BusCommand::Ack(_) => "ACK",
            BusCommand::Stop => "STOP",
        }
    }
}

/// Splits control-register writes into an ordered list of bus commands.
///
/// Priority is fixed: START, WRITE, READ, ACK, STOP. WRITE is only honored
/// while a transaction is open (after START, before STOP); READ and ACK are
/// always emitted so a controller without a peer still echoes TXR.
#[derive(Debug, Default, Clone)]
pub struct ControlWordDecoder {
    open: bool,
}

impl ControlWordDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn reset(&mut self) {
        self.open = false;
    }

    /// Decode one write of `written` to CR. `txr` is the current transmit
    /// register, used as the payload of a WRITE.
    pub fn decode(&mut self, written: u8, txr: u8) -> Vec<BusCommand> {
        let mut pending = ControlFlags::from_bits_truncate(written);
        let mut commands = Vec::with_capacity(5);

        // START may coincide with anything else and resets a stuck transaction.
        if pending.contains(ControlFlags::START) {
            commands.push(BusCommand::Start);
            self.open = true;
            pending.remove(ControlFlags::START);
        }

        if pending.contains(ControlFlags::WRITE) {
            if self.open {
                commands.push(BusCommand::WriteByte(txr));
            } else {
                tracing::debug!(
                    "I2C: ignoring WRITE of {:#04x} outside of a transaction",
                    txr
                );
            }
            pending.remove(ControlFlags::WRITE);
        }
        if pending.contains(ControlFlags::READ) {
            commands.push(BusCommand::ReadByte);
            pending.remove(ControlFlags::READ);
        }
        if pending.contains(ControlFlags::ACK) {
            commands.push(BusCommand::Ack(true));
            pending.remove(ControlFlags::ACK);
        }

        if pending.contains(ControlFlags::STOP) {
            commands.push(BusCommand::Stop);
            self.open = false;
        }

        commands
    }
}
