//! ---
//! hm_section: "15-testing-qa-runbook"
//! hm_subsection: "integration-tests"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Integration and validation tests for the hm2mqtt stack."
//! hm_version: "v0.1.0"
//! hm_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use hm_bridge::{Bridge, BridgeSettings, InboundOutcome};
use hm_metrics::BridgeMetrics;
use hm_protocol::{Availability, Device, EngineCondition, PollIntervals};
use hm_transport::{InMemoryTransport, InboundMessage};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::sleep;

const B2500_INBOUND: &str = "hame_energy/HMA-1/device/testdevice/ctrl";
const B2500_OUTBOUND: &str = "hame_energy/HMA-1/App/testdevice/ctrl";
const B2500_AVAILABILITY: &str = "hm2mqtt/testdevice/availability";

struct Harness {
    transport: InMemoryTransport,
    bridge: Bridge,
    inbound: mpsc::Sender<InboundMessage>,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl Harness {
    fn spawn(devices: Vec<Device>, regular: Duration) -> Self {
        let transport = InMemoryTransport::new();
        let mut settings = BridgeSettings::default();
        settings.devices = devices;
        settings.intervals = PollIntervals {
            regular,
            ..PollIntervals::default()
        };
        let bridge = Bridge::new(
            settings,
            Arc::new(transport.clone()),
            BridgeMetrics::detached().expect("metrics"),
        )
        .expect("bridge");

        let (inbound, inbound_rx) = mpsc::channel(16);
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let runner = bridge.clone();
        let task = tokio::spawn(async move { runner.run(inbound_rx, shutdown_rx).await });
        Self {
            transport,
            bridge,
            inbound,
            shutdown,
            task,
        }
    }

    fn b2500(regular: Duration) -> Self {
        Self::spawn(vec![Device::new("HMA-1", "testdevice")], regular)
    }

    async fn deliver(&self, topic: &str, payload: &str) {
        self.inbound
            .send(InboundMessage::new(topic, payload))
            .await
            .expect("bridge accepts messages");
        sleep(Duration::from_millis(1)).await;
    }

    fn payloads(&self, topic: &str) -> Vec<String> {
        self.transport
            .published_to(topic)
            .into_iter()
            .map(|publication| publication.payload)
            .collect()
    }

    async fn stop(self) -> InMemoryTransport {
        let _ = self.shutdown.send(());
        self.task.await.expect("join").expect("bridge run");
        self.transport
    }
}

#[tokio::test(start_paused = true)]
async fn startup_subscribes_and_announces_bridge() {
    let harness = Harness::b2500(Duration::from_secs(60));
    sleep(Duration::from_millis(10)).await;

    let subscriptions = harness.transport.subscriptions();
    assert!(subscriptions.iter().any(|filter| filter.contains("device/testdevice/ctrl")));
    assert!(subscriptions.contains(&"hm2mqtt/testdevice/control/#".to_owned()));
    assert_eq!(harness.payloads("hm2mqtt/availability"), vec!["online".to_owned()]);
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn discovery_configs_are_announced_and_refreshed_on_first_response() {
    let harness = Harness::b2500(Duration::from_secs(60));
    sleep(Duration::from_millis(10)).await;
    let topic = "homeassistant/sensor/hm2mqtt_testdevice/battery_percentage/config";

    let announced = harness.transport.published_to(topic);
    assert_eq!(announced.len(), 1);
    assert!(announced[0].retain);
    let config: serde_json::Value = serde_json::from_str(&announced[0].payload).expect("json");
    assert_eq!(config["device_class"], "battery");
    assert_eq!(config["unit_of_measurement"], "%");
    assert_eq!(config["state_topic"], "hm2mqtt/testdevice/data");
    assert_eq!(config["device"]["model"], "B2500");
    assert!(config["device"].get("sw_version").is_none());
    assert!(!harness
        .transport
        .published_to("homeassistant/number/hm2mqtt_testdevice/discharge_depth/config")
        .is_empty());

    harness.deliver(B2500_INBOUND, "pe=85,vv=224").await;
    let refreshed = harness.transport.published_to(topic);
    assert_eq!(refreshed.len(), 2);
    let config: serde_json::Value = serde_json::from_str(&refreshed[1].payload).expect("json");
    assert_eq!(config["device"]["sw_version"], "224");
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn incoming_status_publishes_parsed_state() {
    let harness = Harness::b2500(Duration::from_secs(60));
    sleep(Duration::from_millis(10)).await;

    harness
        .deliver(B2500_INBOUND, "pe=85,kn=300,tim_0=06|30|22|00|1234567|400|1")
        .await;

    let state = harness.transport.published_to("hm2mqtt/testdevice/data");
    assert_eq!(state.len(), 1);
    assert!(state[0].retain);
    assert!(state[0].payload.contains("\"batteryPercentage\":85"));
    let decoded: serde_json::Value = serde_json::from_str(&state[0].payload).expect("json state");
    assert_eq!(decoded["batteryCapacity"], 300);
    assert_eq!(decoded["timePeriods[0].startTime"], "6:30");
    assert_eq!(decoded["timePeriods[0].weekday"], "1234567");
    assert_eq!(decoded["timePeriods[0].enabled"], true);
    assert!(decoded.get("timestamp").is_some());

    assert_eq!(harness.payloads(B2500_AVAILABILITY), vec!["online".to_owned()]);
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn polling_requests_status_every_interval() {
    let harness = Harness::b2500(Duration::from_millis(5000));

    sleep(Duration::from_millis(10)).await;
    assert_eq!(harness.payloads(B2500_OUTBOUND), vec!["cd=1".to_owned()]);

    sleep(Duration::from_millis(5490)).await;
    assert_eq!(harness.payloads(B2500_OUTBOUND).len(), 1);

    sleep(Duration::from_millis(1000)).await;
    assert_eq!(harness.payloads(B2500_OUTBOUND), vec!["cd=1".to_owned(), "cd=1".to_owned()]);
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn refresh_requests_are_staggered_per_device() {
    let harness = Harness::spawn(vec![Device::new("HMG", "venus-001")], Duration::from_secs(60));
    let outbound = "hame_energy/HMG/App/venus-001/ctrl";

    sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.payloads(outbound), vec!["cd=1".to_owned()]);

    sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.payloads(outbound), vec!["cd=1".to_owned(), "cd=14".to_owned()]);
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn silent_device_is_reported_offline_once() {
    let harness = Harness::b2500(Duration::from_secs(60));

    sleep(Duration::from_millis(14_500)).await;
    assert!(harness.payloads(B2500_AVAILABILITY).is_empty());

    sleep(Duration::from_millis(1_000)).await;
    let device = Device::new("HMA-1", "testdevice");
    assert_eq!(harness.payloads(B2500_AVAILABILITY), vec!["offline".to_owned()]);
    assert_eq!(harness.bridge.scheduler().availability(&device), Availability::Offline);

    sleep(Duration::from_secs(30)).await;
    assert_eq!(harness.payloads(B2500_AVAILABILITY).len(), 1);
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn response_before_timeout_keeps_device_online() {
    let harness = Harness::b2500(Duration::from_secs(60));
    sleep(Duration::from_secs(2)).await;

    harness.deliver(B2500_INBOUND, "pe=40").await;
    sleep(Duration::from_secs(20)).await;

    assert_eq!(harness.payloads(B2500_AVAILABILITY), vec!["online".to_owned()]);
    assert_eq!(harness.bridge.metrics().online_devices(), 1);
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn offline_device_recovers_on_next_message() {
    let harness = Harness::b2500(Duration::from_secs(60));
    sleep(Duration::from_secs(16)).await;
    assert_eq!(harness.payloads(B2500_AVAILABILITY), vec!["offline".to_owned()]);

    harness.deliver(B2500_INBOUND, "pe=12").await;
    assert_eq!(
        harness.payloads(B2500_AVAILABILITY),
        vec!["offline".to_owned(), "online".to_owned()]
    );
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn control_topics_translate_to_device_commands() {
    let harness = Harness::b2500(Duration::from_secs(600));
    sleep(Duration::from_millis(10)).await;
    harness.transport.take();

    harness
        .deliver("hm2mqtt/testdevice/control/discharge-depth", "50")
        .await;
    harness.deliver("hm2mqtt/testdevice/control/sync-time", "").await;
    harness
        .deliver("hm2mqtt/testdevice/control/discharge-depth", "150")
        .await;
    harness.deliver("hm2mqtt/testdevice/control/foobar", "").await;

    let commands = harness.payloads(B2500_OUTBOUND);
    assert_eq!(commands.len(), 2);
    assert_eq!(commands[0], "cd=5,md=50");
    assert!(commands[1].starts_with("cd=8,wy="));
    assert_eq!(harness.bridge.metrics().conditions("invalid_control_value"), 1);
    assert_eq!(harness.bridge.metrics().conditions("unrecognized_control_suffix"), 1);
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_timers_and_announces_offline() {
    let harness = Harness::b2500(Duration::from_secs(60));
    sleep(Duration::from_millis(10)).await;

    let transport = harness.stop().await;
    sleep(Duration::from_secs(30)).await;

    assert!(transport.published_to(B2500_AVAILABILITY).is_empty());
    let bridge_availability: Vec<String> = transport
        .published_to("hm2mqtt/availability")
        .into_iter()
        .map(|publication| publication.payload)
        .collect();
    assert_eq!(bridge_availability, vec!["online".to_owned(), "offline".to_owned()]);
}

#[tokio::test(start_paused = true)]
async fn handle_inbound_reports_each_outcome() {
    let transport = InMemoryTransport::new();
    let settings = BridgeSettings::default().with_device(Device::new("HMA-1", "testdevice"));
    let bridge = Bridge::new(
        settings,
        Arc::new(transport.clone()),
        BridgeMetrics::detached().expect("metrics"),
    )
    .expect("bridge");

    assert!(matches!(
        bridge.handle_inbound(&InboundMessage::new(B2500_INBOUND, "pe=85")),
        InboundOutcome::StatePublished { .. }
    ));
    assert!(matches!(
        bridge.handle_inbound(&InboundMessage::new("hm2mqtt/testdevice/control/restart", "")),
        InboundOutcome::CommandForwarded { ref payload, .. } if payload == "cd=10"
    ));
    assert!(matches!(
        bridge.handle_inbound(&InboundMessage::new("hm2mqtt/testdevice/control/foobar", "")),
        InboundOutcome::Rejected(EngineCondition::UnrecognizedControlSuffix { .. })
    ));
    assert_eq!(
        bridge.handle_inbound(&InboundMessage::new("unrelated/topic", "pe=1")),
        InboundOutcome::Ignored
    );

    let record = bridge
        .store()
        .get(&Device::new("HMA-1", "testdevice"), "data")
        .expect("merged record");
    assert_eq!(record.fields["batteryPercentage"], 85);
}
