//! The shipped configuration file loads and validates

use lanscout_core::{AddressFamily, AppConfig, LogFormat, RemovalPolicy};
use std::path::Path;

fn shipped_config() -> AppConfig {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/lanscout.yaml");
    AppConfig::from_file(path).expect("Failed to load shipped config")
}

#[test]
fn test_shipped_config_is_valid() {
    let config = shipped_config();
    config.validate().unwrap();

    assert_eq!(config.discovery.poll_interval_ms, 10);
    assert_eq!(config.discovery.removal_policy, RemovalPolicy::Silent);
    assert_eq!(config.discovery.address_family, AddressFamily::Ipv4);
    assert_eq!(config.discovery.domain, "local.");
    assert_eq!(config.logging.format, LogFormat::Text);
}

#[test]
fn test_shipped_config_matches_defaults() {
    let config = shipped_config();
    let defaults = AppConfig::default();

    assert_eq!(config.discovery.poll_interval_ms, defaults.discovery.poll_interval_ms);
    assert_eq!(config.discovery.fanout_grace_ms, defaults.discovery.fanout_grace_ms);
    assert_eq!(
        config.discovery.fanout_queue_capacity,
        defaults.discovery.fanout_queue_capacity
    );
    assert_eq!(config.logging.level, defaults.logging.level);
}
