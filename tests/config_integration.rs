//! ---
//! rl_section: "00-meta"
//! rl_subsection: "integration-tests"
//! rl_type: "source"
//! rl_scope: "test"
//! rl_description: "Shipped configuration checks."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use roomlink_common::config::AppConfig;
use roomlink_core::{AddressTable, ProtocolSettings};

fn example_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../configs/roomlink.example.toml")
}

#[test]
fn example_config_loads_and_resolves() {
    let config = AppConfig::from_path(&example_path()).expect("example config is valid");
    assert_eq!(config.bus.master_address, 0x0001);
    assert_eq!(config.bus.bootloader_settle, Duration::from_millis(1500));
    assert_eq!(config.protocol.time_broadcast_interval, Duration::from_secs(60));

    let table = AddressTable::from_config(&config.addressing).unwrap();
    assert_eq!(table.units(), &[0x0101, 0x0102, 0x0103, 0x0201, 0x0202]);

    let settings = ProtocolSettings::from_config(&config);
    assert_eq!(settings.transfer.chunk_size, 64);
    assert_eq!(settings.log_cadence, settings.attempt_ceiling);
    assert!(!settings.transfer.rearm_write_protect);
}

#[test]
fn explicit_candidate_wins_over_missing_ones() {
    let loaded = AppConfig::load_with_source(&[
        PathBuf::from("does/not/exist.toml"),
        example_path(),
    ])
    .unwrap();
    assert_eq!(loaded.source, example_path());
}

#[test]
fn colliding_addresses_are_rejected() {
    let master_in_table = r#"
        [bus]
        master_address = 0x0101
        [addressing]
        units = [0x0101, 0x0102]
    "#;
    assert!(AppConfig::from_str(master_in_table).is_err());

    let broadcast_unit = r#"
        [addressing]
        units = [0x0101, 0xFFFF]
    "#;
    assert!(AppConfig::from_str(broadcast_unit).is_err());
}

#[test]
fn log_region_must_fit_the_device() {
    let oversized = r#"
        [addressing]
        units = [0x0101]
        [log_region]
        capacity = 1024
        region_start = 512
        region_size = 1024
    "#;
    assert!(AppConfig::from_str(oversized).is_err());

    let ragged = r#"
        [addressing]
        units = [0x0101]
        [log_region]
        region_size = 100
    "#;
    assert!(AppConfig::from_str(ragged).is_err());
}
