// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use anyhow::Context;
use clap::{Parser, Subcommand};
use labwired_config::{BusManifest, ControllerConfig, MAX_DEVICE_ADDRESS};
use labwired_i2c::bus::SystemBus;
use labwired_i2c::metrics::BridgeMetrics;
use labwired_i2c::peripherals::i2c::{StatusFlags, CRSR, TXRX};
use labwired_i2c::transport::{MasterSession, PeerServer};
use labwired_i2c::{Bus, DeviceRegistry, PeripheralStateMachine};
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

const EXIT_OK: u8 = 0;
const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_RUNTIME_ERROR: u8 = 3;

const STA: u32 = 0x80;
const STO: u32 = 0x40;
const RD: u32 = 0x20;
const WR: u32 = 0x10;
const ACK: u32 = 0x08;

/// Reserved addresses 0x00-0x07 and 0x78-0x7F are never probed.
const SCAN_FIRST: u8 = 0x08;
const SCAN_LAST: u8 = 0x77;

fn parse_u8(s: &str) -> Result<u8, String> {
    let trimmed = s.trim();
    if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        u8::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex byte '{}': {}", s, e))
    } else {
        u8::from_str(trimmed).map_err(|e| format!("Invalid byte '{}': {}", s, e))
    }
}

fn parse_device_address(s: &str) -> Result<u8, String> {
    let id = parse_u8(s)?;
    if id > MAX_DEVICE_ADDRESS {
        return Err(format!(
            "Device address {:#04x} is outside the 7-bit range",
            id
        ));
    }
    Ok(id)
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "LabWired I2C bus bridge",
    long_about = None
)]
struct Cli {
    /// Enable per-command tracing
    #[arg(short, long, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the devices of a bus manifest as the I2C peer.
    Serve(ServeArgs),

    /// Probe every 7-bit address through a guest-side controller.
    Scan(MasterArgs),

    /// Read a register range from one device.
    Dump(DumpArgs),
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Path to the bus manifest (YAML)
    #[arg(short, long)]
    manifest: PathBuf,

    /// Override the manifest's listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Stop after this many seconds and print the final registry (JSON)
    #[arg(long)]
    seconds: Option<u64>,
}

#[derive(Parser, Debug)]
struct MasterArgs {
    /// Peer endpoint (host:port)
    #[arg(short, long, conflicts_with = "manifest")]
    peer: Option<String>,

    /// Bus manifest to take the controller from
    #[arg(short, long, requires = "controller")]
    manifest: Option<PathBuf>,

    /// Controller id within the manifest
    #[arg(long)]
    controller: Option<String>,

    /// How long to wait for the peer connection
    #[arg(long, default_value = "2000")]
    connect_wait_ms: u64,
}

#[derive(Parser, Debug)]
struct DumpArgs {
    #[command(flatten)]
    master: MasterArgs,

    /// 7-bit device address
    #[arg(short, long, value_parser = parse_device_address)]
    device: u8,

    /// First register
    #[arg(long, value_parser = parse_u8, default_value = "0")]
    start: u8,

    /// Number of registers to read
    #[arg(long, default_value = "16")]
    len: u16,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries command output.
    let level = if cli.trace {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve(args) => run_serve(args),
        Commands::Scan(args) => run_scan(args),
        Commands::Dump(args) => run_dump(args),
    }
}

fn run_serve(args: ServeArgs) -> ExitCode {
    let manifest = match BusManifest::from_file(&args.manifest) {
        Ok(m) => m,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    let peer_cfg = manifest.peer.clone().unwrap_or_default();
    let listen = args.listen.unwrap_or(peer_cfg.listen);

    let registry = match DeviceRegistry::from_config(&peer_cfg.devices) {
        Ok(r) => r,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    info!(
        "Serving {} device(s) from '{}'",
        registry.len(),
        manifest.name
    );

    let server = match PeerServer::bind(listen.as_str(), PeripheralStateMachine::new(registry)) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to listen on {}: {}", listen, e);
            return ExitCode::from(EXIT_RUNTIME_ERROR);
        }
    };
    println!("listening {}", server.local_addr());

    let deadline = args
        .seconds
        .map(|s| Instant::now() + Duration::from_secs(s));
    while deadline.map_or(true, |d| Instant::now() < d) {
        std::thread::sleep(Duration::from_millis(50));
    }

    info!("Served {} master session(s)", server.sessions());
    let Some(machine) = server.shutdown() else {
        error!("Peer worker did not shut down cleanly");
        return ExitCode::from(EXIT_RUNTIME_ERROR);
    };
    match serde_json::to_string_pretty(&machine.registry().snapshot()) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            error!("Failed to render registry: {}", e);
            return ExitCode::from(EXIT_RUNTIME_ERROR);
        }
    }
    ExitCode::from(EXIT_OK)
}

/// Controller settings for `scan` and `dump`, either ad hoc from `--peer` or
/// taken from a manifest.
fn controller_config(args: &MasterArgs) -> anyhow::Result<ControllerConfig> {
    let ctrl = match (&args.peer, &args.manifest) {
        (Some(peer), _) => ControllerConfig {
            id: "i2c0".to_string(),
            base_address: 0x1001_6000,
            size: None,
            irq: None,
            peer: Some(peer.clone()),
            timeout_ms: 250,
            retry_ms: 100,
            connect_timeout_ms: 1000,
            reconnect: false,
        },
        (None, Some(path)) => {
            let manifest = BusManifest::from_file(path)?;
            let id = args.controller.as_deref().unwrap_or_default();
            manifest
                .controller(id)
                .cloned()
                .with_context(|| format!("No controller '{}' in {:?}", id, path))?
        }
        (None, None) => anyhow::bail!("Either --peer or --manifest is required"),
    };
    if ctrl.peer.is_none() {
        anyhow::bail!("Controller '{}' has no peer to talk to", ctrl.id);
    }
    Ok(ctrl)
}

/// Guest-side view used by `scan` and `dump`: a one-controller bus driven
/// through its registers.
struct Probe {
    bus: SystemBus,
    id: String,
    base: u64,
    metrics: Arc<BridgeMetrics>,
}

impl Probe {
    fn connect(ctrl: ControllerConfig, wait: Duration) -> anyhow::Result<Self> {
        let base = ctrl.base_address;
        let id = ctrl.id.clone();
        let manifest = BusManifest {
            schema_version: "1.0".to_string(),
            name: "probe".to_string(),
            controllers: vec![ctrl],
            peer: None,
        };
        let mut bus = SystemBus::from_config(&manifest)?;

        let metrics = Arc::new(BridgeMetrics::new());
        let bridge = bus.bridge_mut(&id).context("Controller missing from bus")?;
        bridge.add_observer(metrics.clone());

        let connected = bridge
            .link()
            .and_then(|l| l.as_any())
            .and_then(|a| a.downcast_ref::<MasterSession>())
            .is_some_and(|s| s.wait_connected(wait));
        if !connected {
            anyhow::bail!("No peer reachable within {:?}", wait);
        }

        Ok(Self {
            bus,
            id,
            base,
            metrics,
        })
    }

    fn command(&mut self, txr: Option<u8>, cr: u32) -> anyhow::Result<StatusFlags> {
        if let Some(byte) = txr {
            self.bus.write_u32(self.base + TXRX, byte as u32)?;
        }
        self.bus.write_u32(self.base + CRSR, cr)?;
        let sr = self.bus.read_u32(self.base + CRSR)?;
        Ok(StatusFlags::from_bits_truncate(sr as u8))
    }

    fn acked(&mut self, txr: Option<u8>, cr: u32) -> anyhow::Result<bool> {
        Ok(!self.command(txr, cr)?.contains(StatusFlags::RXACK))
    }

    fn ensure_connected(&self) -> anyhow::Result<()> {
        if !self.bus.bridge(&self.id).is_some_and(|b| b.is_connected()) {
            anyhow::bail!("Lost the peer connection");
        }
        Ok(())
    }

    fn scan(&mut self) -> anyhow::Result<Vec<u8>> {
        let mut found = Vec::new();
        for addr in SCAN_FIRST..=SCAN_LAST {
            let ack = self.acked(Some(addr << 1), STA | WR)?;
            self.command(None, STO)?;
            self.ensure_connected()?;
            if ack {
                found.push(addr);
            }
        }
        Ok(found)
    }

    /// Send one addressing byte and close the bus on NACK.
    fn select(&mut self, txr: u8, cr: u32, refused: String) -> anyhow::Result<()> {
        if !self.acked(Some(txr), cr)? {
            self.command(None, STO)?;
            self.ensure_connected()?;
            anyhow::bail!(refused);
        }
        Ok(())
    }

    fn dump(&mut self, device: u8, start: u8, len: u16) -> anyhow::Result<Vec<u8>> {
        self.select(device << 1, STA | WR, format!("No device at {:#04x}", device))?;
        self.select(
            start,
            WR,
            format!("Device {:#04x} refused register {:#04x}", device, start),
        )?;
        self.select(
            (device << 1) | 1,
            STA | WR,
            format!("Device {:#04x} refused the repeated start", device),
        )?;

        let mut out = Vec::with_capacity(len as usize);
        for i in 0..len {
            let cr = if i + 1 == len { RD | STO } else { RD | ACK };
            self.command(None, cr)?;
            out.push(self.bus.read_u32(self.base + TXRX)? as u8);
        }
        if len == 0 {
            self.command(None, STO)?;
        }
        self.ensure_connected()?;
        Ok(out)
    }
}

fn open_probe(args: &MasterArgs) -> Result<Probe, ExitCode> {
    let ctrl = controller_config(args).map_err(|e| {
        error!("{:#}", e);
        ExitCode::from(EXIT_CONFIG_ERROR)
    })?;
    Probe::connect(ctrl, Duration::from_millis(args.connect_wait_ms)).map_err(|e| {
        error!("{:#}", e);
        ExitCode::from(EXIT_RUNTIME_ERROR)
    })
}

fn run_scan(args: MasterArgs) -> ExitCode {
    let mut probe = match open_probe(&args) {
        Ok(p) => p,
        Err(code) => return code,
    };

    match probe.scan() {
        Ok(found) => {
            for addr in &found {
                println!("{:#04x}", addr);
            }
            info!("{} device(s) found", found.len());
            tracing::debug!("Bridge metrics: {}", probe.metrics.to_json());
            ExitCode::from(EXIT_OK)
        }
        Err(e) => {
            error!("Scan failed: {:#}", e);
            ExitCode::from(EXIT_RUNTIME_ERROR)
        }
    }
}

fn run_dump(args: DumpArgs) -> ExitCode {
    let mut probe = match open_probe(&args.master) {
        Ok(p) => p,
        Err(code) => return code,
    };

    match probe.dump(args.device, args.start, args.len) {
        Ok(bytes) => {
            for (row, chunk) in bytes.chunks(16).enumerate() {
                let reg = args.start as usize + row * 16;
                let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
                println!("{:02x}: {}", reg & 0xFF, hex.join(" "));
            }
            tracing::debug!("Bridge metrics: {}", probe.metrics.to_json());
            ExitCode::from(EXIT_OK)
        }
        Err(e) => {
            error!("Dump failed: {:#}", e);
            ExitCode::from(EXIT_RUNTIME_ERROR)
        }
    }
}
