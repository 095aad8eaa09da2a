//! ---
//! hm_section: "06-bridge-runtime"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Bridge runtime and lifecycle management."
//! hm_version: "v0.1.0"
//! hm_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use hm_common::time::local_now;
use hm_logging::{hm_debug, hm_info, hm_warn, log_device_event, DeviceEventOutcome, LogContext};
use hm_metrics::BridgeMetrics;
use hm_protocol::discovery::snapshot;
use hm_protocol::{
    builtin_registry, parse, resolve, ArmedTimer, Availability, Device, DeviceStateStore,
    EngineCondition, PollScheduler, Registry, TimerToken,
};
use hm_transport::{DeviceTopics, InboundMessage, Publication, TopicRoute, Transport};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::discovery;
use crate::settings::BridgeSettings;

/// What [`Bridge::handle_inbound`] did with a message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundOutcome {
    /// Device telemetry was merged and the touched slots republished.
    StatePublished {
        /// Reporting device.
        device: Device,
        /// Publish slots that received a record.
        slots: Vec<String>,
    },
    /// A control request was translated and sent to the device.
    CommandForwarded {
        /// Addressed device.
        device: Device,
        /// Wire payload sent.
        payload: String,
    },
    /// The engine refused the message; nothing was published.
    Rejected(EngineCondition),
    /// Unrelated topic, unconfigured device or unmatched payload.
    Ignored,
}

struct Shared {
    registry: Arc<Registry>,
    store: Arc<DeviceStateStore>,
    scheduler: Arc<PollScheduler>,
    transport: Arc<dyn Transport>,
    metrics: BridgeMetrics,
    topics: DeviceTopics,
    devices: IndexMap<String, Device>,
    timers: Mutex<HashMap<Device, (TimerToken, JoinHandle<()>)>>,
    staggered: Mutex<Vec<JoinHandle<()>>>,
    tick: Duration,
    ticks: AtomicU64,
    discovery_prefix: Option<String>,
}

/// Connects the protocol engine to a [`Transport`].
///
/// Cloning is cheap; clones share all state. Spawned stagger and response
/// timer tasks hold a clone.
#[derive(Clone)]
pub struct Bridge {
    shared: Arc<Shared>,
}

impl Bridge {
    /// Bridge over the built-in device families.
    pub fn new(
        settings: BridgeSettings,
        transport: Arc<dyn Transport>,
        metrics: BridgeMetrics,
    ) -> Result<Self> {
        let registry =
            builtin_registry(settings.intervals).context("failed to build device registry")?;
        Self::with_registry(settings, Arc::new(registry), transport, metrics)
    }

    /// Bridge over an explicit registry.
    ///
    /// Fails when a configured device names an unregistered family or an
    /// instance id is configured twice.
    pub fn with_registry(
        settings: BridgeSettings,
        registry: Arc<Registry>,
        transport: Arc<dyn Transport>,
        metrics: BridgeMetrics,
    ) -> Result<Self> {
        let mut devices = IndexMap::new();
        for device in settings.devices {
            registry
                .require(device.family())
                .with_context(|| format!("device '{}' cannot be bridged", device))?;
            if devices.contains_key(device.instance_id()) {
                bail!("device id '{}' configured more than once", device.instance_id());
            }
            devices.insert(device.instance_id().to_owned(), device);
        }

        Ok(Self {
            shared: Arc::new(Shared {
                registry,
                store: Arc::new(DeviceStateStore::new()),
                scheduler: Arc::new(PollScheduler::new(settings.scheduler)),
                transport,
                metrics,
                topics: settings.topics,
                devices,
                timers: Mutex::new(HashMap::new()),
                staggered: Mutex::new(Vec::new()),
                tick: settings.tick,
                ticks: AtomicU64::new(0),
                discovery_prefix: settings.discovery_prefix,
            }),
        })
    }

    /// Device definitions the bridge parses against.
    pub fn registry(&self) -> Arc<Registry> {
        self.shared.registry.clone()
    }

    /// Accumulated per-device state.
    pub fn store(&self) -> Arc<DeviceStateStore> {
        self.shared.store.clone()
    }

    /// Poll and availability bookkeeping.
    pub fn scheduler(&self) -> Arc<PollScheduler> {
        self.shared.scheduler.clone()
    }

    /// Topic scheme in use.
    pub fn topics(&self) -> &DeviceTopics {
        &self.shared.topics
    }

    /// Bridge counters and gauges.
    pub fn metrics(&self) -> &BridgeMetrics {
        &self.shared.metrics
    }

    /// Configured devices in configuration order.
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.shared.devices.values()
    }

    /// Announce the bridge, publish discovery configs and subscribe to
    /// device and control topics.
    pub fn start(&self) -> Result<()> {
        let shared = &self.shared;
        self.publish(Publication::new(shared.topics.bridge_availability(), "online").retained());
        for device in shared.devices.values() {
            self.publish_discovery(device);
        }
        for device in shared.devices.values() {
            for filter in [
                shared.topics.device_inbound(device),
                shared.topics.control_filter(device),
            ] {
                shared
                    .transport
                    .subscribe(&filter)
                    .with_context(|| format!("failed to subscribe to '{}'", filter))?;
            }
        }
        info!(
            transport = shared.transport.name(),
            prefix = shared.topics.prefix(),
            devices = shared.devices.len(),
            "bridge started"
        );
        Ok(())
    }

    /// Route one inbound message.
    pub fn handle_inbound(&self, message: &InboundMessage) -> InboundOutcome {
        match self.shared.topics.route(&message.topic) {
            Some(TopicRoute::DeviceMessage {
                family,
                instance_id,
            }) => self.handle_device_message(&family, &instance_id, &message.payload),
            Some(TopicRoute::Control {
                instance_id,
                suffix,
            }) => self.handle_control(&instance_id, &suffix, &message.payload),
            None => {
                debug!(topic = %message.topic, "ignoring message on unrelated topic");
                InboundOutcome::Ignored
            }
        }
    }

    fn handle_device_message(
        &self,
        family: &str,
        instance_id: &str,
        payload: &str,
    ) -> InboundOutcome {
        let shared = &self.shared;
        let Some(device) = shared
            .devices
            .get(instance_id)
            .filter(|device| device.family() == family)
            .cloned()
        else {
            debug!(family, device = instance_id, "message from unconfigured device");
            return InboundOutcome::Ignored;
        };

        let outcome = parse(&shared.registry, payload, family, instance_id);
        for condition in &outcome.conditions {
            shared.metrics.record_condition(condition.kind());
        }
        if !outcome.matched() {
            debug!(device = %device, "payload matched no message definition");
            return InboundOutcome::Ignored;
        }
        shared.metrics.record_parsed(family);

        let slots: Vec<String> = outcome.slots().map(str::to_owned).collect();
        for (slot, record) in outcome.records {
            shared.store.merge(&device, &slot, record);
            shared.metrics.record_merged(family, &slot);
        }

        let response = shared
            .scheduler
            .record_response(&device, tokio::time::Instant::now().into_std());
        if let Some((_, timer)) = shared.timers.lock().remove(&device) {
            timer.abort();
        }

        for slot in &slots {
            self.publish_slot(&device, slot);
        }
        if response.came_online {
            self.publish_discovery(&device);
            self.publish_availability(&device, Availability::Online);
            log_device_event(
                Some(&LogContext::for_device(device.family(), device.instance_id())),
                "device.online",
                "device answered",
                DeviceEventOutcome::Success,
            );
            self.refresh_online_gauge();
        }
        InboundOutcome::StatePublished { device, slots }
    }

    fn handle_control(&self, instance_id: &str, suffix: &str, payload: &str) -> InboundOutcome {
        let shared = &self.shared;
        let Some(device) = shared.devices.get(instance_id).cloned() else {
            warn!(device = instance_id, suffix, "control request for unconfigured device");
            return InboundOutcome::Ignored;
        };

        let rendered = resolve(&shared.registry, device.family(), suffix)
            .and_then(|command| command.render(suffix, payload, local_now()));
        match rendered {
            Ok(wire) => {
                shared.metrics.record_control(suffix, true);
                hm_info!(
                    context = LogContext::for_device(device.family(), device.instance_id()),
                    "forwarding control '{}' as '{}'",
                    suffix,
                    wire
                );
                let topic = shared.topics.device_outbound(&device);
                self.publish(Publication::new(topic, wire.as_str()));
                InboundOutcome::CommandForwarded {
                    device,
                    payload: wire,
                }
            }
            Err(condition) => {
                shared.metrics.record_condition(condition.kind());
                let label = match &condition {
                    EngineCondition::UnrecognizedControlSuffix { .. } => "unrecognized",
                    _ => suffix,
                };
                shared.metrics.record_control(label, false);
                log_device_event(
                    Some(&LogContext::for_device(device.family(), device.instance_id())),
                    "control.rejected",
                    &format!("'{}': {}", suffix, condition),
                    DeviceEventOutcome::Degraded,
                );
                InboundOutcome::Rejected(condition)
            }
        }
    }

    /// Request every due message of every configured device.
    ///
    /// Returns the number of refresh requests issued.
    pub fn poll_tick(&self, now: Instant) -> usize {
        let shared = &self.shared;
        let tick = shared.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        let mut issued = 0;
        for device in shared.devices.values() {
            let Some(definition) = shared.registry.get(device.family()) else {
                continue;
            };
            let plan = shared.scheduler.tick(device, definition, now);
            if plan.is_empty() {
                continue;
            }
            hm_debug!(
                context = LogContext::for_device(device.family(), device.instance_id())
                    .with_tick(tick),
                "requesting {} message(s)",
                plan.requests.len()
            );

            let topic = shared.topics.device_outbound(device);
            for request in plan.requests {
                shared.metrics.record_refresh(device.family(), &request.slot);
                let publication = Publication::new(topic.as_str(), request.payload);
                if request.delay.is_zero() {
                    self.publish(publication);
                } else {
                    let bridge = self.clone();
                    let delay = request.delay;
                    let handle = tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        bridge.publish(publication);
                    });
                    let mut staggered = shared.staggered.lock();
                    staggered.retain(|pending| !pending.is_finished());
                    staggered.push(handle);
                }
                issued += 1;
            }
            if let Some(armed) = plan.armed {
                self.arm_timer(device, armed);
            }
        }
        issued
    }

    fn arm_timer(&self, device: &Device, armed: ArmedTimer) {
        let bridge = self.clone();
        let target = device.clone();
        let deadline = tokio::time::Instant::from_std(armed.deadline);
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            bridge.expire(&target, armed.token);
        });
        if let Some((_, previous)) = self
            .shared
            .timers
            .lock()
            .insert(device.clone(), (armed.token, handle))
        {
            previous.abort();
        }
    }

    fn expire(&self, device: &Device, token: TimerToken) {
        let shared = &self.shared;
        {
            let mut timers = shared.timers.lock();
            if timers.get(device).map(|(armed, _)| *armed) == Some(token) {
                timers.remove(device);
            }
        }
        let now = tokio::time::Instant::now().into_std();
        let Some(event) = shared.scheduler.fire(device, token, now) else {
            debug!(device = %device, token = token.get(), "stale response timer ignored");
            return;
        };
        shared.metrics.record_unreachable(event.device.family());
        self.publish_availability(&event.device, Availability::Offline);
        log_device_event(
            Some(&LogContext::for_device(event.device.family(), event.device.instance_id())),
            "device.unreachable",
            "no response before the timeout elapsed",
            DeviceEventOutcome::Fault,
        );
        self.refresh_online_gauge();
    }

    fn publish_slot(&self, device: &Device, slot: &str) {
        let Some(flat) = self.shared.store.flatten_slot(device, slot) else {
            return;
        };
        match serde_json::to_string(&flat) {
            Ok(body) => {
                let topic = self.shared.topics.state(device, slot);
                self.publish(Publication::new(topic, body).retained());
            }
            Err(err) => {
                warn!(device = %device, slot, error = %err, "failed to serialize device state");
            }
        }
    }

    /// Retained discovery config per entity, refreshed so firmware learned
    /// from state reaches the device block.
    fn publish_discovery(&self, device: &Device) {
        let shared = &self.shared;
        let Some(prefix) = shared.discovery_prefix.as_deref() else {
            return;
        };
        let view = match snapshot(&shared.registry, &shared.store, device) {
            Ok(view) => view,
            Err(condition) => {
                hm_warn!(
                    context = LogContext::for_device(device.family(), device.instance_id()),
                    "discovery skipped: {}",
                    condition
                );
                return;
            }
        };
        let configs = discovery::publications(prefix, &shared.topics, &view);
        debug!(device = %device, entities = configs.len(), "publishing discovery configs");
        for publication in configs {
            self.publish(publication);
        }
    }

    fn publish_availability(&self, device: &Device, availability: Availability) {
        if let Some(payload) = availability.payload() {
            let topic = self.shared.topics.availability(device);
            self.publish(Publication::new(topic, payload).retained());
        }
    }

    fn publish(&self, publication: Publication) {
        let topic = publication.topic.clone();
        if let Err(err) = self.shared.transport.publish(publication) {
            self.shared.metrics.record_publish_failure();
            warn!(%topic, error = %err, "publish failed");
        }
    }

    fn refresh_online_gauge(&self) {
        let online = self
            .shared
            .devices
            .values()
            .filter(|device| self.shared.scheduler.availability(device) == Availability::Online)
            .count();
        self.shared.metrics.set_online_devices(online);
    }

    /// Start, then process inbound messages and poll ticks until shutdown
    /// or until the inbound channel closes.
    pub async fn run(
        &self,
        mut inbound: mpsc::Receiver<InboundMessage>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        self.start()?;
        let mut ticker = tokio::time::interval(self.shared.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("bridge shutdown signal received");
                    break;
                }
                message = inbound.recv() => match message {
                    Some(message) => {
                        self.handle_inbound(&message);
                    }
                    None => {
                        info!("inbound channel closed");
                        break;
                    }
                },
                instant = ticker.tick() => {
                    self.poll_tick(instant.into_std());
                }
            }
        }

        self.stop();
        Ok(())
    }

    /// Cancel response timers and pending staggered refreshes, then
    /// announce the bridge as offline.
    pub fn stop(&self) {
        for (_, (_, timer)) in self.shared.timers.lock().drain() {
            timer.abort();
        }
        for pending in self.shared.staggered.lock().drain(..) {
            pending.abort();
        }
        self.publish(
            Publication::new(self.shared.topics.bridge_availability(), "offline").retained(),
        );
        info!("bridge stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hm_transport::InMemoryTransport;

    fn bridge(transport: &InMemoryTransport) -> Bridge {
        let settings = BridgeSettings::default().with_device(Device::new("HMA-1", "testdevice"));
        Bridge::new(
            settings,
            Arc::new(transport.clone()),
            BridgeMetrics::detached().expect("metrics"),
        )
        .expect("bridge")
    }

    #[test]
    fn rejects_unknown_family_in_configuration() {
        let settings = BridgeSettings::default().with_device(Device::new("NOPE", "x"));
        let result = Bridge::new(
            settings,
            Arc::new(InMemoryTransport::new()),
            BridgeMetrics::detached().expect("metrics"),
        );
        assert!(result.is_err());
    }

    #[test]
    fn rejects_duplicate_instance_ids() {
        let settings = BridgeSettings::default()
            .with_device(Device::new("HMA-1", "dup"))
            .with_device(Device::new("HMG", "dup"));
        let result = Bridge::new(
            settings,
            Arc::new(InMemoryTransport::new()),
            BridgeMetrics::detached().expect("metrics"),
        );
        assert!(result.is_err());
    }

    #[test]
    fn start_announces_and_subscribes() {
        let transport = InMemoryTransport::new();
        bridge(&transport).start().expect("start");
        assert_eq!(
            transport.subscriptions(),
            vec![
                "hame_energy/HMA-1/device/testdevice/ctrl".to_owned(),
                "hm2mqtt/testdevice/control/#".to_owned(),
            ]
        );
        let announced = transport.published_to("hm2mqtt/availability");
        assert_eq!(announced.len(), 1);
        assert_eq!(announced[0].payload, "online");
        assert!(announced[0].retain);
    }

    #[tokio::test]
    async fn device_payload_publishes_slot_state() {
        let transport = InMemoryTransport::new();
        let bridge = bridge(&transport);
        let outcome = bridge.handle_inbound(&InboundMessage::new(
            "hame_energy/HMA-1/device/testdevice/ctrl",
            "pe=85,kn=300",
        ));
        assert!(matches!(
            outcome,
            InboundOutcome::StatePublished { ref slots, .. } if *slots == vec!["data".to_owned()]
        ));

        let state = transport.published_to("hm2mqtt/testdevice/data");
        assert_eq!(state.len(), 1);
        assert!(state[0].retain);
        assert!(state[0].payload.contains("\"batteryPercentage\":85"));
        assert_eq!(
            transport.published_to("hm2mqtt/testdevice/availability")[0].payload,
            "online"
        );
        assert_eq!(bridge.metrics().online_devices(), 1);
    }

    #[test]
    fn unmatched_payload_publishes_nothing() {
        let transport = InMemoryTransport::new();
        let bridge = bridge(&transport);
        let outcome = bridge.handle_inbound(&InboundMessage::new(
            "hame_energy/HMA-1/device/testdevice/ctrl",
            "kn=300",
        ));
        assert_eq!(outcome, InboundOutcome::Ignored);
        assert!(transport.publications().is_empty());
    }

    #[test]
    fn traffic_from_unconfigured_devices_is_ignored() {
        let transport = InMemoryTransport::new();
        let bridge = bridge(&transport);
        for topic in [
            "hame_energy/HMA-1/device/other/ctrl",
            "hame_energy/HMG/device/testdevice/ctrl",
            "hm2mqtt/other/control/refresh",
        ] {
            assert_eq!(
                bridge.handle_inbound(&InboundMessage::new(topic, "pe=1")),
                InboundOutcome::Ignored
            );
        }
        assert!(transport.publications().is_empty());
    }

    #[test]
    fn control_requests_are_forwarded_or_rejected() {
        let transport = InMemoryTransport::new();
        let bridge = bridge(&transport);

        let forwarded =
            bridge.handle_inbound(&InboundMessage::new("hm2mqtt/testdevice/control/refresh", ""));
        assert!(matches!(
            forwarded,
            InboundOutcome::CommandForwarded { ref payload, .. } if payload == "cd=1"
        ));
        let outbound = transport.published_to("hame_energy/HMA-1/App/testdevice/ctrl");
        assert_eq!(outbound.len(), 1);
        assert!(!outbound[0].retain);

        let rejected =
            bridge.handle_inbound(&InboundMessage::new("hm2mqtt/testdevice/control/foobar", ""));
        assert!(matches!(
            rejected,
            InboundOutcome::Rejected(EngineCondition::UnrecognizedControlSuffix { .. })
        ));
        assert_eq!(transport.publications().len(), 1);
        assert_eq!(bridge.metrics().conditions("unrecognized_control_suffix"), 1);
    }

    #[test]
    fn publish_failures_are_counted() {
        let transport = InMemoryTransport::new();
        let bridge = bridge(&transport);
        transport.set_rejecting(true);
        bridge.handle_inbound(&InboundMessage::new("hm2mqtt/testdevice/control/refresh", ""));
        assert_eq!(bridge.metrics().publish_failures(), 1);
    }

    fn venus_bridge(transport: &InMemoryTransport) -> Bridge {
        let settings = BridgeSettings::default().with_device(Device::new("HMG", "venus-001"));
        Bridge::new(
            settings,
            Arc::new(transport.clone()),
            BridgeMetrics::detached().expect("metrics"),
        )
        .expect("bridge")
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_staggered_refreshes() {
        let transport = InMemoryTransport::new();
        let bridge = venus_bridge(&transport);
        let issued = bridge.poll_tick(tokio::time::Instant::now().into_std());
        assert_eq!(issued, 2);

        bridge.stop();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let outbound: Vec<String> = transport
            .published_to("hame_energy/HMG/App/venus-001/ctrl")
            .into_iter()
            .map(|publication| publication.payload)
            .collect();
        assert_eq!(outbound, vec!["cd=1".to_owned()]);
    }

    #[test]
    fn start_publishes_retained_discovery_configs() {
        let transport = InMemoryTransport::new();
        venus_bridge(&transport).start().expect("start");
        let soc =
            transport.published_to("homeassistant/sensor/hm2mqtt_venus-001/battery_soc/config");
        assert_eq!(soc.len(), 1);
        assert!(soc[0].retain);
        assert!(soc[0].payload.contains("\"device_class\":\"battery\""));
    }

    #[test]
    fn discovery_can_be_disabled() {
        let transport = InMemoryTransport::new();
        let mut settings = BridgeSettings::default().with_device(Device::new("HMG", "venus-001"));
        settings.discovery_prefix = None;
        Bridge::new(
            settings,
            Arc::new(transport.clone()),
            BridgeMetrics::detached().expect("metrics"),
        )
        .expect("bridge")
        .start()
        .expect("start");
        assert!(transport
            .publications()
            .iter()
            .all(|publication| !publication.topic.starts_with("homeassistant/")));
    }
}
