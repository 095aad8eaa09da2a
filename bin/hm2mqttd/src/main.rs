//! ---
//! hm_section: "07-daemon"
//! hm_subsection: "binary"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Binary entrypoint for the hm2mqtt daemon."
//! hm_version: "v0.1.0"
//! hm_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use hm_bridge::{Bridge, BridgeSettings};
use hm_common::time::duration_to_millis;
use hm_common::{init_tracing, AppConfig, LogFormat};
use hm_metrics::{new_registry, spawn_http_server, BridgeMetrics};
use hm_protocol::{builtin_registry, PollIntervals};
use hm_transport::{pump_events, MqttSettings, MqttTransport, Publication};
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

const INBOUND_CAPACITY: usize = 256;

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("hm2mqtt ", env!("CARGO_PKG_VERSION")),
    about = "Bridge Hame energy storage devices to MQTT",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, help = "Override the configured log format")]
    log_format: Option<CliLogFormat>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliLogFormat {
    Json,
    Pretty,
}

impl From<CliLogFormat> for LogFormat {
    fn from(value: CliLogFormat) -> Self {
        match value {
            CliLogFormat::Json => LogFormat::StructuredJson,
            CliLogFormat::Pretty => LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the bridge")]
    Run,
    #[command(about = "Load and validate the configuration, then exit")]
    CheckConfig,
    #[command(about = "List supported device families and their control topics")]
    ListFamilies,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Some(Commands::ListFamilies) => list_families(),
        Some(Commands::CheckConfig) => {
            let (config, source) = load_config(cli.config.as_ref(), cli.log_format)?;
            render_config_summary(&config, source.as_ref())
        }
        Some(Commands::Run) | None => {
            let (config, _) = load_config(cli.config.as_ref(), cli.log_format)?;
            run_daemon(config).await
        }
    }
}

fn load_config(
    explicit: Option<&PathBuf>,
    log_format: Option<CliLogFormat>,
) -> Result<(AppConfig, Option<PathBuf>)> {
    let mut candidates = Vec::new();
    if let Some(path) = explicit {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/hm2mqtt.toml"));
    candidates.push(PathBuf::from("/etc/hm2mqtt/hm2mqtt.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    if let Some(format) = log_format {
        config.logging.format = format.into();
    }
    init_tracing("hm2mqttd", &config.logging)?;
    match &loaded.source {
        Some(path) => info!(config_path = %path.display(), "configuration loaded"),
        None => info!("configuration loaded from defaults and environment"),
    }
    Ok((config, loaded.source))
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    let registry = new_registry();
    let metrics = BridgeMetrics::new(registry.clone())?;
    let metrics_server = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(spawn_http_server(registry, config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let settings = BridgeSettings::from_config(&config);
    let availability = settings.topics.bridge_availability();
    let endpoint = config.mqtt.endpoint()?;
    let mut mqtt = MqttSettings::new(
        endpoint.host,
        endpoint.port,
        config.mqtt.effective_client_id(),
    );
    mqtt.tls = endpoint.tls;
    mqtt.keep_alive = config.mqtt.keep_alive;
    mqtt.credentials = endpoint.credentials;
    mqtt.last_will = Some(Publication::new(availability.as_str(), "offline").retained());
    mqtt.birth = Some(Publication::new(availability.as_str(), "online").retained());

    let (transport, eventloop) = MqttTransport::connect(mqtt);
    let bridge = Bridge::new(settings, Arc::new(transport.clone()), metrics)?;

    let (bridge_shutdown, bridge_shutdown_rx) = broadcast::channel(1);
    let (pump_shutdown, pump_shutdown_rx) = broadcast::channel(1);
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
    let pump = tokio::spawn(pump_events(eventloop, transport, inbound_tx, pump_shutdown_rx));
    let runner = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.run(inbound_rx, bridge_shutdown_rx).await })
    };

    info!(devices = bridge.devices().count(), "daemon running; waiting for termination signal");
    wait_for_signal().await?;
    info!("termination signal received; shutting down");

    // The bridge queues its offline announcement; the pump flushes it before disconnecting.
    let _ = bridge_shutdown.send(());
    runner.await.context("bridge task panicked")??;
    let _ = pump_shutdown.send(());
    if let Err(err) = pump.await {
        warn!(error = %err, "mqtt event pump join error");
    }

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = signal::ctrl_c() => result.context("failed to listen for ctrl-c")?,
            _ = terminate.recv() => info!("SIGTERM received"),
        }
    }
    #[cfg(not(unix))]
    signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    Ok(())
}

fn render_config_summary(config: &AppConfig, source: Option<&PathBuf>) -> Result<()> {
    let endpoint = config.mqtt.endpoint()?;
    let registry =
        builtin_registry(PollIntervals::default()).context("failed to build device registry")?;
    for device in &config.devices {
        registry.require(&device.family).with_context(|| {
            format!("device '{}:{}' cannot be bridged", device.family, device.id)
        })?;
    }
    let source = source
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "defaults + environment".to_owned());
    println!("Source: {}", source);
    println!(
        "Broker: {}:{} (client id {}, tls {}, authenticated {})",
        endpoint.host,
        endpoint.port,
        config.mqtt.effective_client_id(),
        endpoint.tls,
        endpoint.credentials.is_some()
    );
    println!("Topic prefix: {}", config.mqtt.topic_prefix);
    println!(
        "Polling: every {} ms, slow {} ms, timeout {} ms",
        duration_to_millis(config.polling.interval),
        duration_to_millis(config.polling.slow_interval),
        duration_to_millis(config.polling.response_timeout)
    );
    if config.discovery.enabled {
        println!("Discovery prefix: {}", config.discovery.prefix);
    }
    for device in &config.devices {
        println!("Device: {}:{}", device.family, device.id);
    }
    Ok(())
}

fn list_families() -> Result<()> {
    let registry =
        builtin_registry(PollIntervals::default()).context("failed to build device registry")?;
    let mut listing = Vec::new();
    for family in registry.families() {
        let Some(definition) = registry.get(family) else {
            continue;
        };
        listing.push(serde_json::json!({
            "family": family,
            "messages": definition
                .messages()
                .iter()
                .map(|message| serde_json::json!({
                    "name": message.name(),
                    "slot": message.publish_slot(),
                    "refresh": message.refresh_payload(),
                }))
                .collect::<Vec<_>>(),
            "controls": definition.controls().suffixes().collect::<Vec<_>>(),
        }));
    }
    println!("{}", serde_json::to_string_pretty(&listing)?);
    Ok(())
}
