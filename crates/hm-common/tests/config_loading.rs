//! ---
//! hm_section: "01-core-functionality"
//! hm_subsection: "tests"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Shared primitives and utilities for the bridge runtime."
//! hm_version: "v0.1.0"
//! hm_owner: "tbd"
//! ---
use std::fs;
use std::time::Duration;

use hm_common::{AppConfig, LogFormat};

const SAMPLE: &str = r#"
[mqtt]
broker_url = "mqtt://broker.lan:1883"
username = "bridge"
password = "secret"
topic_prefix = "energy"

[[devices]]
family = "HMA-1"
id = "0019aa0d4dcb"

[[devices]]
family = "HMG"
id = "venus-001"

[polling]
interval = 30000
stagger = 250

[logging]
format = "pretty"

[metrics]
enabled = true
listen = "127.0.0.1:9900"
"#;

#[test]
fn loads_first_existing_candidate() {
    let dir = tempfile::tempdir().expect("tempdir");
    let missing = dir.path().join("missing.toml");
    let present = dir.path().join("hm2mqtt.toml");
    fs::write(&present, SAMPLE).expect("write config");

    let loaded = AppConfig::load_with_source(&[missing, present.clone()]).expect("load config");
    assert_eq!(loaded.source.as_deref(), Some(present.as_path()));

    let config = loaded.config;
    assert_eq!(config.mqtt.topic_prefix, "energy");
    assert_eq!(config.polling.stagger, Duration::from_millis(250));
    assert_eq!(config.logging.format, LogFormat::Pretty);
    assert!(config.metrics.enabled);
}

#[test]
fn rejects_unparsable_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("broken.toml");
    fs::write(&path, "[mqtt\nbroker_url = ").expect("write config");
    let err = AppConfig::load(&[path]).expect_err("broken config");
    assert!(format!("{:#}", err).contains("failed to parse config file"));
}

#[test]
fn from_str_rejects_unknown_scheme() {
    let source = SAMPLE.replace("mqtt://broker.lan:1883", "ws://broker.lan");
    assert!(source.parse::<AppConfig>().is_err());
}
