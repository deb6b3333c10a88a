// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use labwired_config::ControllerConfig;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// `host:port` of the peer process.
    pub endpoint: String,
    /// Upper bound for a single TCP connect attempt.
    pub connect_timeout: Duration,
    /// Upper bound for one request/reply exchange seen from the guest.
    pub round_trip_timeout: Duration,
    /// Pause between connection attempts while no peer is reachable.
    pub retry_interval: Duration,
    /// Re-establish the connection after a transport error.
    pub reconnect: bool,
}

impl TransportConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// Transport settings for a controller, or `None` when it has no peer.
    pub fn from_controller(cfg: &ControllerConfig) -> Option<Self> {
        let endpoint = cfg.peer.clone()?;
        Some(Self {
            endpoint,
            connect_timeout: Duration::from_millis(cfg.connect_timeout_ms),
            round_trip_timeout: Duration::from_millis(cfg.timeout_ms),
            retry_interval: Duration::from_millis(cfg.retry_ms),
            reconnect: cfg.reconnect,
        })
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:7450".to_string(),
            connect_timeout: Duration::from_secs(1),
            round_trip_timeout: Duration::from_millis(250),
            retry_interval: Duration::from_millis(100),
            reconnect: true,
        }
    }
}
