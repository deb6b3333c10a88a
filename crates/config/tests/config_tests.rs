// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use labwired_config::BusManifest;

#[test]
fn test_minimal_controller_parses() {
    let yaml = r#"
name: "board"
controllers:
  - id: "i2c0"
    base_address: 0x10016000
"#;
    let manifest: BusManifest = serde_yaml::from_str(yaml).unwrap();
    assert!(manifest.validate().is_ok());
    assert_eq!(manifest.schema_version, "1.0");
    assert_eq!(manifest.controllers[0].size, None);
    assert_eq!(manifest.controllers[0].irq, None);
    assert_eq!(manifest.controllers[0].peer, None);
    assert!(manifest.peer.is_none());
}

#[test]
fn test_linked_controller_fields_parse() {
    let yaml = r#"
name: "board"
controllers:
  - id: "i2c0"
    base_address: 0x10016000
    size: "4KiB"
    irq: 52
    peer: "localhost:7450"
    timeout_ms: 40
    retry_ms: 10
    connect_timeout_ms: 200
    reconnect: false
"#;
    let manifest: BusManifest = serde_yaml::from_str(yaml).unwrap();
    assert!(manifest.validate().is_ok());
    let ctrl = &manifest.controllers[0];
    assert_eq!(ctrl.size, Some("4KiB".to_string()));
    assert_eq!(ctrl.peer.as_deref(), Some("localhost:7450"));
    assert_eq!(ctrl.timeout_ms, 40);
    assert_eq!(ctrl.retry_ms, 10);
    assert_eq!(ctrl.connect_timeout_ms, 200);
    assert!(!ctrl.reconnect);
}

#[test]
fn test_bad_size_rejected() {
    let yaml = r#"
name: "board"
controllers:
  - id: "i2c0"
    base_address: 0x10016000
    size: "huge"
"#;
    let manifest: BusManifest = serde_yaml::from_str(yaml).unwrap();
    let err = manifest.validate().unwrap_err();
    assert!(format!("{:#}", err).contains("size"));
}
