// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use super::{read_frame, SessionState, TransportError, POLL_INTERVAL};
use crate::i2c::state_machine::PeripheralStateMachine;
use crate::i2c::wire::{Selector, REQUEST_LEN};
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Peer side of the I2C socket link: the process that models the physical
/// targets.
///
/// One worker thread accepts a master, serves it until it goes away, resets
/// the bus and waits for the next one. The [`PeripheralStateMachine`] and its
/// registry live on that thread; the outside world only sees JSON copies
/// published after every STOP, and gets the machine back from
/// [`PeerServer::shutdown`].
#[derive(Debug)]
pub struct PeerServer {
    state: Arc<SessionState>,
    local_addr: SocketAddr,
    snapshot: Arc<Mutex<serde_json::Value>>,
    sessions: Arc<AtomicU64>,
    worker: Option<JoinHandle<PeripheralStateMachine>>,
}

impl PeerServer {
    pub fn bind<A: ToSocketAddrs>(
        addr: A,
        machine: PeripheralStateMachine,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        tracing::info!("I2C peer listening on {}", local_addr);

        let state = Arc::new(SessionState::default());
        let snapshot = Arc::new(Mutex::new(machine.registry().snapshot()));
        let sessions = Arc::new(AtomicU64::new(0));

        let worker = thread::Builder::new()
            .name(format!("i2c-peer-{}", local_addr))
            .spawn({
                let state = state.clone();
                let snapshot = snapshot.clone();
                let sessions = sessions.clone();
                move || run_peer(listener, machine, state, snapshot, sessions)
            })?;

        Ok(Self {
            state,
            local_addr,
            snapshot,
            sessions,
            worker: Some(worker),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Number of master connections accepted so far.
    pub fn sessions(&self) -> u64 {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Registry contents as of the last completed transaction.
    pub fn registry_snapshot(&self) -> serde_json::Value {
        self.snapshot
            .lock()
            .map(|s| s.clone())
            .unwrap_or(serde_json::Value::Null)
    }

    /// Force-close the current master connection, if any. The server keeps
    /// listening.
    pub fn drop_client(&self) {
        self.state.close();
    }

    /// Stop serving and hand back the state machine with its registry.
    pub fn shutdown(mut self) -> Option<PeripheralStateMachine> {
        self.stop_worker()
    }

    fn stop_worker(&mut self) -> Option<PeripheralStateMachine> {
        self.state.request_stop();
        self.state.close();
        let worker = self.worker.take()?;
        match worker.join() {
            Ok(machine) => Some(machine),
            Err(_) => {
                tracing::error!("I2C peer: worker for {} panicked", self.local_addr);
                None
            }
        }
    }
}

impl Drop for PeerServer {
    fn drop(&mut self) {
        let _ = self.stop_worker();
    }
}

fn run_peer(
    listener: TcpListener,
    mut machine: PeripheralStateMachine,
    state: Arc<SessionState>,
    snapshot: Arc<Mutex<serde_json::Value>>,
    sessions: Arc<AtomicU64>,
) -> PeripheralStateMachine {
    while !state.should_stop() {
        match listener.accept() {
            Ok((stream, master)) => {
                sessions.fetch_add(1, Ordering::SeqCst);
                tracing::info!("I2C peer: master connected from {}", master);
                machine.reset();

                match serve(stream, &mut machine, &state, &snapshot) {
                    Ok(()) => tracing::info!("I2C peer: master {} disconnected", master),
                    Err(e) => tracing::warn!("I2C peer: session with {} ended: {}", master, e),
                }
                state.close();
                publish(&machine, &snapshot);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                tracing::warn!("I2C peer: accept failed: {}", e);
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
    tracing::debug!("I2C peer: worker exiting");
    machine
}

fn serve(
    mut stream: TcpStream,
    machine: &mut PeripheralStateMachine,
    state: &SessionState,
    snapshot: &Mutex<serde_json::Value>,
) -> Result<(), TransportError> {
    // Accepted sockets may inherit the listener's non-blocking mode.
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(POLL_INTERVAL))?;
    state.install(&stream)?;

    let mut frame = [0u8; REQUEST_LEN];
    while read_frame(&mut stream, &mut frame, &state.stop)? {
        tracing::trace!("I2C peer: rx {:02x?}", frame);
        let reply = machine.handle_frame(frame);
        stream.write_all(&reply.encode())?;

        if frame[0] == Selector::Stop as u8 {
            publish(machine, snapshot);
        }
    }
    Ok(())
}

fn publish(machine: &PeripheralStateMachine, snapshot: &Mutex<serde_json::Value>) {
    if let Ok(mut slot) = snapshot.lock() {
        *slot = machine.registry().snapshot();
    }
}
