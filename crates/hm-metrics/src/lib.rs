//! ---
//! hm_section: "05-observability"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Metrics collection and export utilities."
//! hm_version: "v0.1.0"
//! hm_owner: "tbd"
//! ---
//! Prometheus instrumentation for the bridge and its scrape endpoint.
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Registry shared between the bridge and the exporter.
pub type SharedRegistry = Arc<Registry>;

/// Fresh shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Bind `addr` and serve the registry at `/metrics`.
///
/// Binding happens synchronously so configuration mistakes surface before
/// the bridge starts; serving runs on a spawned task.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry);

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .context("failed to configure metrics listener as non-blocking")?;
    let bound = std_listener
        .local_addr()
        .context("failed to read metrics listener address")?;
    let listener =
        TcpListener::from_std(std_listener).context("failed to register metrics listener")?;

    info!(address = %bound, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task,
    })
}

async fn metrics_handler(State(registry): State<SharedRegistry>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&registry.gather()) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error").into_response()
        }
    }
}

/// Handle to the running exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Address actually bound, useful when port 0 was requested.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting scrapes and wait for the server task.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.await.context("metrics server task panicked")?
    }
}

/// Counters and gauges recorded by the bridge runtime.
#[derive(Clone, Debug)]
pub struct BridgeMetrics {
    registry: SharedRegistry,
    messages_parsed: IntCounterVec,
    records_merged: IntCounterVec,
    conditions: IntCounterVec,
    refresh_requests: IntCounterVec,
    control_commands: IntCounterVec,
    publish_failures: IntCounter,
    device_unreachable: IntCounterVec,
    online_devices: IntGauge,
}

impl BridgeMetrics {
    /// Register every bridge metric in `registry`.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let messages_parsed = IntCounterVec::new(
            Opts::new(
                "hm2mqtt_messages_parsed_total",
                "Device payloads that matched at least one message definition",
            ),
            &["family"],
        )?;
        registry.register(Box::new(messages_parsed.clone()))?;

        let records_merged = IntCounterVec::new(
            Opts::new(
                "hm2mqtt_records_merged_total",
                "Records merged into device state by publish slot",
            ),
            &["family", "slot"],
        )?;
        registry.register(Box::new(records_merged.clone()))?;

        let conditions = IntCounterVec::new(
            Opts::new(
                "hm2mqtt_engine_conditions_total",
                "Non-fatal engine conditions by kind",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(conditions.clone()))?;

        let refresh_requests = IntCounterVec::new(
            Opts::new(
                "hm2mqtt_refresh_requests_total",
                "Refresh payloads published to devices",
            ),
            &["family", "slot"],
        )?;
        registry.register(Box::new(refresh_requests.clone()))?;

        let control_commands = IntCounterVec::new(
            Opts::new(
                "hm2mqtt_control_commands_total",
                "Control requests by suffix and result",
            ),
            &["suffix", "result"],
        )?;
        registry.register(Box::new(control_commands.clone()))?;

        let publish_failures = IntCounter::with_opts(Opts::new(
            "hm2mqtt_publish_failures_total",
            "Publications rejected by the transport",
        ))?;
        registry.register(Box::new(publish_failures.clone()))?;

        let device_unreachable = IntCounterVec::new(
            Opts::new(
                "hm2mqtt_device_unreachable_total",
                "Response timeouts that marked a device offline",
            ),
            &["family"],
        )?;
        registry.register(Box::new(device_unreachable.clone()))?;

        let online_devices = IntGauge::with_opts(Opts::new(
            "hm2mqtt_online_devices",
            "Devices whose last observed event was a parsed response",
        ))?;
        registry.register(Box::new(online_devices.clone()))?;

        Ok(Self {
            registry,
            messages_parsed,
            records_merged,
            conditions,
            refresh_requests,
            control_commands,
            publish_failures,
            device_unreachable,
            online_devices,
        })
    }

    /// Metrics registered in a private registry; used where nothing scrapes.
    pub fn detached() -> Result<Self> {
        Self::new(new_registry())
    }

    /// Registry holding these metrics.
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_parsed(&self, family: &str) {
        self.messages_parsed.with_label_values(&[family]).inc();
    }

    pub fn record_merged(&self, family: &str, slot: &str) {
        self.records_merged.with_label_values(&[family, slot]).inc();
    }

    pub fn record_condition(&self, kind: &str) {
        self.conditions.with_label_values(&[kind]).inc();
    }

    pub fn record_refresh(&self, family: &str, slot: &str) {
        self.refresh_requests.with_label_values(&[family, slot]).inc();
    }

    pub fn record_control(&self, suffix: &str, accepted: bool) {
        let result = if accepted { "accepted" } else { "rejected" };
        self.control_commands.with_label_values(&[suffix, result]).inc();
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.inc();
    }

    pub fn record_unreachable(&self, family: &str) {
        self.device_unreachable.with_label_values(&[family]).inc();
    }

    pub fn set_online_devices(&self, count: usize) {
        self.online_devices.set(count as i64);
    }

    /// Current value of the publish failure counter.
    pub fn publish_failures(&self) -> u64 {
        self.publish_failures.get()
    }

    /// Current value of the condition counter for `kind`.
    pub fn conditions(&self, kind: &str) -> u64 {
        self.conditions.with_label_values(&[kind]).get()
    }

    /// Current value of the online-device gauge.
    pub fn online_devices(&self) -> i64 {
        self.online_devices.get()
    }
}

pub use prometheus;
