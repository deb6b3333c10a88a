// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use super::{BusLink, SessionState, TransportError, POLL_INTERVAL};
use crate::config::TransportConfig;
use crate::i2c::wire::{Reply, Request, REPLY_LEN};
use std::any::Any;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Envelope {
    seq: u64,
    request: Request,
    deadline: Instant,
}

#[derive(Debug)]
struct Completion {
    seq: u64,
    result: Result<Reply, TransportError>,
}

enum SessionEnd {
    Stopped,
    Lost,
}

/// Master side of the I2C socket link.
///
/// A worker thread owns the `TcpStream`: it connects, retries while the peer
/// is unreachable and reconnects after errors. Guest-side calls hand each
/// request to the worker over a channel and wait for its completion, so
/// requests stay strictly ordered and every wait is bounded by the
/// round-trip timeout.
#[derive(Debug)]
pub struct MasterSession {
    state: Arc<SessionState>,
    config: TransportConfig,
    requests: Sender<Envelope>,
    completions: Receiver<Completion>,
    next_seq: u64,
    worker: Option<JoinHandle<()>>,
}

impl MasterSession {
    /// Start the worker. Returns once the endpoint resolves; the connection
    /// itself is established in the background.
    pub fn connect(config: TransportConfig) -> Result<Self, TransportError> {
        let addr = resolve(&config.endpoint)?;
        let (req_tx, req_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let state = Arc::new(SessionState::default());

        let worker = thread::Builder::new()
            .name(format!("i2c-master-{}", addr))
            .spawn({
                let state = state.clone();
                let config = config.clone();
                move || run_worker(addr, config, state, req_rx, done_tx)
            })?;

        Ok(Self {
            state,
            config,
            requests: req_tx,
            completions: done_rx,
            next_seq: 0,
            worker: Some(worker),
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Poll until the worker reports a live connection or `timeout` passes.
    pub fn wait_connected(&self, timeout: Duration) -> bool {
        let until = Instant::now() + timeout;
        while Instant::now() < until {
            if self.state.is_connected() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        self.state.is_connected()
    }

    pub fn shutdown(&mut self) {
        self.state.request_stop();
        self.state.close();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("I2C link: worker for {} panicked", self.config.endpoint);
            }
        }
    }
}

impl Drop for MasterSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl BusLink for MasterSession {
    fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    fn round_trip(&mut self, request: Request) -> Result<Reply, TransportError> {
        if !self.state.is_connected() {
            return Err(TransportError::NotConnected);
        }

        self.next_seq += 1;
        let seq = self.next_seq;
        let timeout = self.config.round_trip_timeout;
        let deadline = Instant::now() + timeout;

        self.requests
            .send(Envelope {
                seq,
                request,
                deadline,
            })
            .map_err(|_| TransportError::WorkerGone)?;

        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.completions.recv_timeout(left) {
                Ok(done) if done.seq == seq => return done.result,
                Ok(done) => {
                    tracing::trace!("I2C link: discarding late completion #{}", done.seq);
                }
                Err(RecvTimeoutError::Timeout) => {
                    // Whatever is still in flight would desync the stream.
                    self.state.close();
                    return Err(TransportError::Timeout(timeout));
                }
                Err(RecvTimeoutError::Disconnected) => return Err(TransportError::WorkerGone),
            }
        }
    }

    fn disconnect(&mut self) {
        self.state.close();
    }

    fn as_any(&self) -> Option<&dyn Any> {
        Some(self)
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        Some(self)
    }
}

fn resolve(endpoint: &str) -> Result<SocketAddr, TransportError> {
    endpoint.to_socket_addrs()?.next().ok_or_else(|| {
        TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("endpoint '{}' did not resolve", endpoint),
        ))
    })
}

fn run_worker(
    addr: SocketAddr,
    config: TransportConfig,
    state: Arc<SessionState>,
    requests: Receiver<Envelope>,
    completions: Sender<Completion>,
) {
    while !state.should_stop() {
        let stream = match TcpStream::connect_timeout(&addr, config.connect_timeout) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!("I2C link: connect to {} failed: {}", addr, e);
                state.sleep(config.retry_interval);
                continue;
            }
        };

        // Anything queued before this connection existed belongs to a guest
        // call that has already given up.
        while let Ok(stale) = requests.try_recv() {
            tracing::trace!("I2C link: dropping stale request #{}", stale.seq);
        }

        let setup = stream
            .set_nodelay(true)
            .and_then(|_| stream.set_read_timeout(Some(config.round_trip_timeout)))
            .and_then(|_| state.install(&stream));
        if let Err(e) = setup {
            tracing::warn!("I2C link: failed to set up socket to {}: {}", addr, e);
            state.close();
            state.sleep(config.retry_interval);
            continue;
        }
        tracing::info!("I2C link: connected to {}", addr);

        let end = serve(stream, &config, &state, &requests, &completions);
        state.close();

        match end {
            SessionEnd::Stopped => break,
            SessionEnd::Lost if config.reconnect => {
                tracing::info!("I2C link: reconnecting to {}", addr);
                state.sleep(config.retry_interval);
            }
            SessionEnd::Lost => break,
        }
    }
    tracing::debug!("I2C link: worker for {} exiting", addr);
}

fn serve(
    mut stream: TcpStream,
    config: &TransportConfig,
    state: &SessionState,
    requests: &Receiver<Envelope>,
    completions: &Sender<Completion>,
) -> SessionEnd {
    loop {
        let envelope = match requests.recv_timeout(POLL_INTERVAL) {
            Ok(envelope) => envelope,
            Err(RecvTimeoutError::Timeout) => {
                if state.should_stop() {
                    return SessionEnd::Stopped;
                }
                if !state.is_connected() {
                    // Closed from the guest side after a timeout.
                    return SessionEnd::Lost;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => return SessionEnd::Stopped,
        };

        if Instant::now() >= envelope.deadline {
            tracing::trace!("I2C link: request #{} expired in queue", envelope.seq);
            continue;
        }

        let result = exchange(&mut stream, envelope.request, config.round_trip_timeout);
        let lost = match &result {
            Ok(reply) => {
                tracing::trace!(
                    "I2C link: {:02x?} -> {:#04x}",
                    envelope.request.encode(),
                    reply.data()
                );
                false
            }
            Err(e) => {
                tracing::warn!("I2C link: exchange with {} failed: {}", config.endpoint, e);
                true
            }
        };

        let _ = completions.send(Completion {
            seq: envelope.seq,
            result,
        });

        if lost {
            return SessionEnd::Lost;
        }
        if state.should_stop() {
            return SessionEnd::Stopped;
        }
    }
}

fn exchange(
    stream: &mut TcpStream,
    request: Request,
    timeout: Duration,
) -> Result<Reply, TransportError> {
    stream.write_all(&request.encode())?;
    let mut buf = [0u8; REPLY_LEN];
    stream
        .read_exact(&mut buf)
        .map_err(|e| TransportError::from_read(e, timeout))?;
    Ok(Reply(buf[0]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_round_trip_without_peer_is_not_connected() {
        // Bind then drop to get a port nobody listens on.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut cfg = TransportConfig::new(format!("127.0.0.1:{}", port));
        cfg.retry_interval = Duration::from_millis(10);

        let mut session = MasterSession::connect(cfg).unwrap();
        assert!(!session.is_connected());
        assert!(matches!(
            session.round_trip(Request::from(crate::BusCommand::Start)),
            Err(TransportError::NotConnected)
        ));
        session.shutdown();
    }

    #[test]
    fn test_silent_peer_times_out_and_disconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut cfg = TransportConfig::new(listener.local_addr().unwrap().to_string());
        cfg.round_trip_timeout = Duration::from_millis(50);
        cfg.reconnect = false;

        let mut session = MasterSession::connect(cfg).unwrap();
        let (_held, _) = listener.accept().unwrap();
        assert!(session.wait_connected(Duration::from_secs(2)));

        let started = Instant::now();
        let res = session.round_trip(Request::from(crate::BusCommand::Start));
        assert!(matches!(res, Err(TransportError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!session.is_connected());
    }

    #[test]
    fn test_bad_endpoint_rejected() {
        let res = MasterSession::connect(TransportConfig::new("not an endpoint"));
        assert!(matches!(res, Err(TransportError::Io(_))));
    }
}
