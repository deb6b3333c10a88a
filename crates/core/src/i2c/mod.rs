// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! I2C bus virtualization.
//!
//! The guest-facing controller (`peripherals::i2c::MasterBridge`) turns
//! control-word writes into [`command::BusCommand`]s, ships each one as a
//! fixed-size [`wire::Request`] and stores the one-byte [`wire::Reply`] back
//! into its registers. On the far side a
//! [`state_machine::PeripheralStateMachine`] replays the same bus phases
//! against a [`registry::DeviceRegistry`].

pub mod command;
pub mod registry;
pub mod state_machine;
pub mod wire;

/// Highest valid 7-bit device address.
pub const MAX_DEVICE_ID: u8 = 0x7F;
