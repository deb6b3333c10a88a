// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Highest 7-bit target address.
pub const MAX_DEVICE_ADDRESS: u8 = 0x7F;

/// Register window of a controller without an explicit `size`.
pub const DEFAULT_WINDOW_SIZE: u64 = 0x1000;

/// Default schema version for YAML configs
fn default_schema_version() -> String {
    "1.0".to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    250
}

fn default_retry_ms() -> u64 {
    100
}

fn default_connect_timeout_ms() -> u64 {
    1000
}

fn default_listen() -> String {
    "127.0.0.1:7450".to_string()
}

/// One guest-visible I2C controller.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ControllerConfig {
    pub id: String,
    pub base_address: u64,
    #[serde(default)]
    pub size: Option<String>, // e.g. "4KiB"
    #[serde(default)]
    pub irq: Option<u32>,
    /// `host:port` of the peripheral process. Without it the controller
    /// runs in loopback.
    #[serde(default)]
    pub peer: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retry_ms")]
    pub retry_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub reconnect: bool,
}

impl ControllerConfig {
    /// Size of the guest register window in bytes.
    pub fn window_size(&self) -> Result<u64> {
        match &self.size {
            Some(size) => parse_size(size),
            None => Ok(DEFAULT_WINDOW_SIZE),
        }
    }
}

/// A target device served by the peer, with optional initial register
/// contents.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DeviceConfig {
    pub address: u8,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub registers: BTreeMap<u8, u8>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PeerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            devices: Vec::new(),
        }
    }
}

/// Describes both ends of a virtual I2C setup: the controllers the guest
/// sees and, optionally, the peer process with its devices.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BusManifest {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub name: String,
    #[serde(default)]
    pub controllers: Vec<ControllerConfig>,
    #[serde(default)]
    pub peer: Option<PeerConfig>,
}

impl BusManifest {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let f = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open bus manifest at {:?}", path.as_ref()))?;
        let manifest: Self =
            serde_yaml::from_reader(f).context("Failed to parse Bus Manifest YAML")?;
        manifest.validate()?;
        tracing::debug!(
            "Loaded bus manifest '{}' ({} controllers)",
            manifest.name,
            manifest.controllers.len()
        );
        Ok(manifest)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let manifest: Self = serde_yaml::from_str(yaml).context("Failed to parse Bus Manifest YAML")?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema_version != "1.0" {
            anyhow::bail!(
                "Unsupported schema_version '{}'. Supported versions: '1.0'",
                self.schema_version
            );
        }

        let mut ids = HashSet::new();
        for ctrl in &self.controllers {
            if ctrl.id.trim().is_empty() {
                anyhow::bail!("Controller 'id' cannot be empty");
            }
            if !ids.insert(ctrl.id.as_str()) {
                anyhow::bail!("Duplicate controller id '{}'", ctrl.id);
            }
            if ctrl.timeout_ms == 0 {
                anyhow::bail!("Controller '{}': 'timeout_ms' must be greater than zero", ctrl.id);
            }
            if ctrl.retry_ms == 0 {
                anyhow::bail!("Controller '{}': 'retry_ms' must be greater than zero", ctrl.id);
            }
            if ctrl.connect_timeout_ms == 0 {
                anyhow::bail!(
                    "Controller '{}': 'connect_timeout_ms' must be greater than zero",
                    ctrl.id
                );
            }
            let bytes = ctrl
                .window_size()
                .with_context(|| format!("Controller '{}': bad 'size'", ctrl.id))?;
            if bytes == 0 {
                anyhow::bail!("Controller '{}': 'size' must be greater than zero", ctrl.id);
            }
            if ctrl.base_address.checked_add(bytes - 1).is_none() {
                anyhow::bail!(
                    "Controller '{}': window at {:#x} overruns the address space",
                    ctrl.id,
                    ctrl.base_address
                );
            }
            if ctrl.peer.as_ref().is_some_and(|p| p.trim().is_empty()) {
                anyhow::bail!("Controller '{}': 'peer' cannot be empty", ctrl.id);
            }
        }

        if let Some(peer) = &self.peer {
            if peer.listen.trim().is_empty() {
                anyhow::bail!("Peer 'listen' address cannot be empty");
            }
            let mut addresses = HashSet::new();
            for dev in &peer.devices {
                if dev.address > MAX_DEVICE_ADDRESS {
                    anyhow::bail!(
                        "Device address {:#04x} is outside the 7-bit range",
                        dev.address
                    );
                }
                if !addresses.insert(dev.address) {
                    anyhow::bail!("Duplicate device address {:#04x}", dev.address);
                }
            }
        }

        Ok(())
    }

    pub fn controller(&self, id: &str) -> Option<&ControllerConfig> {
        self.controllers.iter().find(|c| c.id == id)
    }
}

pub fn parse_size(size_str: &str) -> Result<u64> {
    use human_size::{Byte, Size, SpecificSize};
    let s: Size = size_str
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid size format: {}", e))?;
    let bytes: SpecificSize<Byte> = s.into();
    Ok(bytes.value() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    const FULL: &str = r#"
schema_version: "1.0"
name: "hifive"
controllers:
  - id: "i2c0"
    base_address: 0x10016000
    irq: 52
    peer: "127.0.0.1:7450"
    timeout_ms: 500
peer:
  listen: "127.0.0.1:7450"
  devices:
    - address: 0x50
      name: "eeprom"
      registers: { 0x00: 0x12, 0x01: 0x34 }
    - address: 0x48
"#;

    fn write_temp_file(prefix: &str, contents: &str) -> std::path::PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push("labwired-config-tests");
        let _ = std::fs::create_dir_all(&dir);

        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let path = dir.join(format!("{}-{}.yaml", prefix, nonce));
        std::fs::write(&path, contents).expect("Failed to write temp file");
        path
    }

    #[test]
    fn test_valid_manifest() {
        let manifest = BusManifest::from_yaml(FULL).unwrap();
        assert_eq!(manifest.name, "hifive");

        let ctrl = manifest.controller("i2c0").unwrap();
        assert_eq!(ctrl.base_address, 0x1001_6000);
        assert_eq!(ctrl.irq, Some(52));
        assert_eq!(ctrl.timeout_ms, 500);
        assert_eq!(ctrl.retry_ms, 100);
        assert!(ctrl.reconnect);

        let peer = manifest.peer.as_ref().unwrap();
        assert_eq!(peer.devices.len(), 2);
        assert_eq!(peer.devices[0].name.as_deref(), Some("eeprom"));
        assert_eq!(peer.devices[0].registers.get(&0x01), Some(&0x34));
        assert!(peer.devices[1].registers.is_empty());
    }

    #[test]
    fn test_from_file() {
        let path = write_temp_file("manifest", FULL);
        let manifest = BusManifest::from_file(&path).unwrap();
        assert_eq!(manifest.controllers.len(), 1);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_missing_file_names_path() {
        let err = BusManifest::from_file("/nonexistent/bus.yaml").unwrap_err();
        assert!(err.to_string().contains("bus.yaml"));
    }

    #[test]
    fn test_invalid_version() {
        let err = BusManifest::from_yaml("schema_version: \"2.0\"\nname: x\n").unwrap_err();
        assert!(err.to_string().contains("Unsupported schema_version"));
    }

    #[test]
    fn test_duplicate_controller_id() {
        let yaml = r#"
name: "dup"
controllers:
  - id: "i2c0"
    base_address: 0x1000
  - id: "i2c0"
    base_address: 0x2000
"#;
        let err = BusManifest::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("Duplicate controller id"));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let yaml = r#"
name: "t"
controllers:
  - id: "i2c0"
    base_address: 0x1000
    timeout_ms: 0
"#;
        let err = BusManifest::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("timeout_ms"));
    }

    #[test]
    fn test_window_past_address_space_rejected() {
        let yaml = r#"
name: "t"
controllers:
  - id: "i2c0"
    base_address: 18446744073709547520 # 2^64 - 4KiB
    size: "8KiB"
"#;
        let err = BusManifest::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("overruns"));

        // A window ending exactly at the top is fine.
        let yaml = yaml.replace("8KiB", "4KiB");
        let manifest = BusManifest::from_yaml(&yaml).unwrap();
        assert_eq!(manifest.controllers[0].window_size().unwrap(), 4096);
    }

    #[test]
    fn test_device_address_out_of_range() {
        let yaml = r#"
name: "t"
peer:
  devices:
    - address: 0x80
"#;
        let err = BusManifest::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("7-bit"));
    }

    #[test]
    fn test_duplicate_device_address() {
        let yaml = r#"
name: "t"
peer:
  devices:
    - address: 0x50
    - address: 0x50
"#;
        let err = BusManifest::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("Duplicate device address"));
    }

    #[test]
    fn test_peer_defaults() {
        let manifest = BusManifest::from_yaml("name: t\npeer: {}\n").unwrap();
        assert_eq!(manifest.peer.unwrap().listen, "127.0.0.1:7450");
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("256B").unwrap(), 256);
        assert_eq!(parse_size("4KiB").unwrap(), 4096);
        assert!(parse_size("lots").is_err());
    }
}
