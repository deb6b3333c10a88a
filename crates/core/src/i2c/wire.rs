// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Fixed-size framing for the master <-> peer socket.
//!
//! A request is always `[selector, value]`, a reply is always one byte. There
//! is no length prefix or checksum; TCP ordering is the only framing.

use super::command::BusCommand;

pub const REQUEST_LEN: usize = 2;
pub const REPLY_LEN: usize = 1;

/// Reply byte for an acknowledged command.
pub const ACK: u8 = 0x01;
/// Reply byte for a refused command.
pub const NACK: u8 = 0x00;
/// What a read returns when nobody drives the bus.
pub const IDLE_BUS: u8 = 0xFF;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unknown request selector {0:#04x}")]
    UnknownSelector(u8),
}

/// Which control-word flag a request stands for. Values match the CR bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Selector {
    Start = 0x80,
    Stop = 0x40,
    Read = 0x20,
    Write = 0x10,
    Ack = 0x08,
}

impl TryFrom<u8> for Selector {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x80 => Ok(Selector::Start),
            0x40 => Ok(Selector::Stop),
            0x20 => Ok(Selector::Read),
            0x10 => Ok(Selector::Write),
            0x08 => Ok(Selector::Ack),
            other => Err(WireError::UnknownSelector(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub selector: Selector,
    pub value: u8,
}

impl Request {
    pub fn encode(&self) -> [u8; REQUEST_LEN] {
        [self.selector as u8, self.value]
    }

    pub fn decode(frame: [u8; REQUEST_LEN]) -> Result<Self, WireError> {
        Ok(Self {
            selector: Selector::try_from(frame[0])?,
            value: frame[1],
        })
    }

    pub fn command(&self) -> BusCommand {
        match self.selector {
            Selector::Start => BusCommand::Start,
            Selector::Stop => BusCommand::Stop,
            Selector::Read => BusCommand::ReadByte,
            Selector::Write => BusCommand::WriteByte(self.value),
            Selector::Ack => BusCommand::Ack(self.value & ACK != 0),
        }
    }
}

impl From<BusCommand> for Request {
    fn from(cmd: BusCommand) -> Self {
        let (selector, value) = match cmd {
            BusCommand::Start => (Selector::Start, 0),
            BusCommand::Stop => (Selector::Stop, 0),
            BusCommand::ReadByte => (Selector::Read, 0),
            BusCommand::WriteByte(v) => (Selector::Write, v),
            BusCommand::Ack(ack) => (Selector::Ack, if ack { ACK } else { NACK }),
        };
        Self { selector, value }
    }
}

/// One-byte answer. Its meaning depends on the request it answers: a data
/// byte for reads, an ACK bit for everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply(pub u8);

impl Reply {
    pub fn ack() -> Self {
        Reply(ACK)
    }

    pub fn nack() -> Self {
        Reply(NACK)
    }

    pub fn is_ack(&self) -> bool {
        self.0 & ACK != 0
    }

    pub fn data(&self) -> u8 {
        self.0
    }

    pub fn encode(&self) -> [u8; REPLY_LEN] {
        [self.0]
    }
}
