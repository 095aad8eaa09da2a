//! ---
//! hm_section: "15-testing-qa-runbook"
//! hm_subsection: "integration-tests"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Integration and validation tests for the hm2mqtt stack."
//! hm_version: "v0.1.0"
//! hm_owner: "tbd"
//! ---
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use hm_bridge::{Bridge, BridgeSettings};
use hm_common::AppConfig;
use hm_metrics::BridgeMetrics;
use hm_protocol::Device;
use hm_transport::{InMemoryTransport, InboundMessage};

fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
        .collect()
}

#[test]
fn environment_only_configuration_drives_bridge() {
    let mut config = AppConfig::default();
    config
        .apply_overrides(env(&[
            ("MQTT_BROKER_URL", "mqtt://test-broker:1883"),
            ("MQTT_CLIENT_ID", "test-client"),
            ("MQTT_USERNAME", "testuser"),
            ("MQTT_PASSWORD", "testpass"),
            ("DEVICE_1", "HMA-1:testdevice"),
            ("MQTT_POLLING_INTERVAL", "5000"),
        ]))
        .expect("overrides");
    config.validate().expect("valid configuration");

    let endpoint = config.mqtt.endpoint().expect("endpoint");
    assert_eq!((endpoint.host.as_str(), endpoint.port), ("test-broker", 1883));
    assert_eq!(
        endpoint.credentials,
        Some(("testuser".to_owned(), "testpass".to_owned()))
    );
    assert_eq!(config.mqtt.effective_client_id(), "test-client");

    let settings = BridgeSettings::from_config(&config);
    assert_eq!(settings.intervals.regular, Duration::from_millis(5000));
    assert_eq!(settings.devices, vec![Device::new("HMA-1", "testdevice")]);

    let transport = InMemoryTransport::new();
    let bridge = Bridge::new(
        settings,
        Arc::new(transport.clone()),
        BridgeMetrics::detached().expect("metrics"),
    )
    .expect("bridge");
    bridge.start().expect("start");
    assert!(transport
        .subscriptions()
        .contains(&"hame_energy/HMA-1/device/testdevice/ctrl".to_owned()));
}

#[tokio::test]
async fn file_configuration_sets_topic_prefix() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    write!(
        file,
        r#"
[mqtt]
broker_url = "tcp://broker.local:1884"
topic_prefix = "energy"

[[devices]]
family = "HMG"
id = "venus-001"

[polling]
response_timeout = 5000
"#
    )
    .expect("write config");

    let config: AppConfig = std::fs::read_to_string(file.path())
        .expect("read config")
        .parse()
        .expect("parse config");
    assert_eq!(config.polling.response_timeout, Duration::from_secs(5));

    let transport = InMemoryTransport::new();
    let bridge = Bridge::new(
        BridgeSettings::from_config(&config),
        Arc::new(transport.clone()),
        BridgeMetrics::detached().expect("metrics"),
    )
    .expect("bridge");

    bridge.handle_inbound(&InboundMessage::new(
        "hame_energy/HMG/device/venus-001/ctrl",
        "cd=1,cel_p=300,cel_c=60,tot_i=1200,tot_o=800",
    ));
    let state = transport.published_to("energy/venus-001/data");
    assert_eq!(state.len(), 1);
    let decoded: serde_json::Value = serde_json::from_str(&state[0].payload).expect("json");
    assert_eq!(decoded["batterySoc"], 60);
    assert_eq!(decoded["batteryCapacity"], 3000);
    assert_eq!(decoded["totalChargingCapacity"], 12);
    assert_eq!(decoded["totalDischargeCapacity"], 8);
}

#[test]
fn unknown_family_in_configuration_is_rejected() {
    let config: AppConfig = r#"
[[devices]]
family = "NOPE"
id = "x"
"#
    .parse()
    .expect("structurally valid");
    let result = Bridge::new(
        BridgeSettings::from_config(&config),
        Arc::new(InMemoryTransport::new()),
        BridgeMetrics::detached().expect("metrics"),
    );
    assert!(result.is_err());
}
