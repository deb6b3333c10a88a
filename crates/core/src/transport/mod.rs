// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Socket sessions carrying the I2C wire protocol.
//!
//! Each side runs one worker thread per connection doing blocking
//! read/process/write. The simulation thread only touches the lifecycle
//! flags and the mutex-guarded socket slot in [`SessionState`].

pub mod master;
pub mod peer;

pub use master::MasterSession;
pub use peer::PeerServer;

use crate::i2c::state_machine::PeripheralStateMachine;
use crate::i2c::wire::{Reply, Request, WireError};
use std::any::Any;
use std::io::{self, Read};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How often blocked workers wake up to look at the stop flag.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("socket I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("no peer connected")]
    NotConnected,
    #[error("peer closed the connection")]
    Closed,
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("transport worker has exited")]
    WorkerGone,
}

impl TransportError {
    pub(crate) fn from_read(e: io::Error, timeout: Duration) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => TransportError::Timeout(timeout),
            io::ErrorKind::UnexpectedEof => TransportError::Closed,
            _ => TransportError::Io(e),
        }
    }
}

/// Seam between the guest-facing controller and whatever carries its
/// requests to a peer.
pub trait BusLink: std::fmt::Debug + Send {
    fn is_connected(&self) -> bool;
    /// Send one request and block for its reply.
    fn round_trip(&mut self, request: Request) -> Result<Reply, TransportError>;
    /// Drop the current connection. Implementations may reconnect later.
    fn disconnect(&mut self);
    fn as_any(&self) -> Option<&dyn Any> {
        None
    }
    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        None
    }
}

/// Lifecycle shared between a session handle and its worker thread.
#[derive(Debug, Default)]
pub(crate) struct SessionState {
    pub(crate) connected: AtomicBool,
    pub(crate) stop: AtomicBool,
    /// Clone of the live stream, kept so another thread can force it closed.
    socket: Mutex<Option<TcpStream>>,
}

impl SessionState {
    pub(crate) fn install(&self, stream: &TcpStream) -> io::Result<()> {
        let clone = stream.try_clone()?;
        if let Ok(mut slot) = self.socket.lock() {
            *slot = Some(clone);
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Mark disconnected and shut the socket down, unblocking any pending
    /// read on the worker thread.
    pub(crate) fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Ok(mut slot) = self.socket.lock() {
            if let Some(stream) = slot.take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub(crate) fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Sleep for `total`, waking early once stop is requested.
    pub(crate) fn sleep(&self, total: Duration) {
        let until = Instant::now() + total;
        while !self.should_stop() {
            let left = until.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            std::thread::sleep(left.min(POLL_INTERVAL));
        }
    }
}

/// Fill `buf` completely, riding out read timeouts so the stop flag can be
/// polled without losing a partially received frame.
///
/// Returns `Ok(false)` on EOF before the first byte or when stop is requested.
pub(crate) fn read_frame(
    stream: &mut TcpStream,
    buf: &mut [u8],
    stop: &AtomicBool,
) -> Result<bool, TransportError> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(TransportError::Closed),
            Ok(n) => filled += n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                if stop.load(Ordering::SeqCst) {
                    return Ok(false);
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

/// Drives a [`PeripheralStateMachine`] directly on the caller's thread, for
/// boards that keep their I2C targets in the same process.
#[derive(Debug)]
pub struct InProcessLink {
    machine: PeripheralStateMachine,
    connected: bool,
}

impl InProcessLink {
    pub fn new(machine: PeripheralStateMachine) -> Self {
        Self {
            machine,
            connected: true,
        }
    }

    pub fn machine(&self) -> &PeripheralStateMachine {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut PeripheralStateMachine {
        &mut self.machine
    }

    pub fn into_machine(self) -> PeripheralStateMachine {
        self.machine
    }

    /// Re-attach after `disconnect`, starting from a fresh bus.
    pub fn reconnect(&mut self) {
        self.machine.reset();
        self.connected = true;
    }
}

impl BusLink for InProcessLink {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn round_trip(&mut self, request: Request) -> Result<Reply, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        Ok(self.machine.handle(request))
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn as_any(&self) -> Option<&dyn Any> {
        Some(self)
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        Some(self)
    }
}
