//! ---
//! hm_section: "01-core-functionality"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Shared primitives and utilities for the bridge runtime."
//! hm_version: "v0.1.0"
//! hm_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;
use url::{Host, Url};

use crate::logging::LogFormat;

fn default_broker_url() -> String {
    "mqtt://localhost:1883".to_owned()
}

fn default_topic_prefix() -> String {
    "hm2mqtt".to_owned()
}

fn default_discovery_enabled() -> bool {
    true
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_owned()
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(30)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_slow_poll_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_response_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_stagger() -> Duration {
    Duration::from_millis(100)
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9899))
}

/// Primary configuration object for the hm2mqtt bridge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    /// `None` when the configuration came from defaults and environment only.
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "HM2MQTT_CONFIG";
    pub const ENV_BROKER_URL: &'static str = "MQTT_BROKER_URL";
    pub const ENV_CLIENT_ID: &'static str = "MQTT_CLIENT_ID";
    pub const ENV_USERNAME: &'static str = "MQTT_USERNAME";
    pub const ENV_PASSWORD: &'static str = "MQTT_PASSWORD";
    pub const ENV_POLLING_INTERVAL: &'static str = "MQTT_POLLING_INTERVAL";
    pub const ENV_RESPONSE_TIMEOUT: &'static str = "MQTT_RESPONSE_TIMEOUT";
    pub const ENV_DEVICE_PREFIX: &'static str = "DEVICE_";

    /// Load configuration, respecting `HM2MQTT_CONFIG` and the MQTT
    /// environment overrides.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration together with the effective source path.
    ///
    /// When neither the override variable nor any candidate points at a file
    /// the defaults are used, so a bridge can be configured from the
    /// environment alone.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        let mut loaded = Self::read_source(candidates)?;
        loaded.config.apply_overrides(std::env::vars())?;
        loaded.config.validate()?;
        Ok(loaded)
    }

    fn read_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            let path = candidate.as_ref();
            if path.exists() {
                let config = Self::from_path(path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path.to_path_buf()),
                });
            }
        }

        debug!(
            inspected = %candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            "no configuration file found; using defaults"
        );
        Ok(LoadedAppConfig {
            config: AppConfig::default(),
            source: None,
        })
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Apply `MQTT_*` and `DEVICE_<n>` overrides from `vars`.
    ///
    /// Devices given through the environment replace the configured list and
    /// are ordered by their numeric suffix.
    pub fn apply_overrides<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut devices: Vec<(u32, DeviceConfig)> = Vec::new();
        for (key, value) in vars {
            let value = value.trim().to_owned();
            match key.as_str() {
                Self::ENV_BROKER_URL => self.mqtt.broker_url = value,
                Self::ENV_CLIENT_ID => self.mqtt.client_id = Some(value),
                Self::ENV_USERNAME => self.mqtt.username = Some(value),
                Self::ENV_PASSWORD => self.mqtt.password = Some(value),
                Self::ENV_POLLING_INTERVAL => {
                    self.polling.interval = parse_millis(&key, &value)?;
                }
                Self::ENV_RESPONSE_TIMEOUT => {
                    self.polling.response_timeout = parse_millis(&key, &value)?;
                }
                _ => {
                    let Some(index) = key.strip_prefix(Self::ENV_DEVICE_PREFIX) else {
                        continue;
                    };
                    let Ok(index) = index.parse::<u32>() else {
                        continue;
                    };
                    let device = value
                        .parse::<DeviceConfig>()
                        .map_err(|err| anyhow!("{}: {}", key, err))?;
                    devices.push((index, device));
                }
            }
        }
        if !devices.is_empty() {
            devices.sort_by_key(|(index, _)| *index);
            self.devices = devices.into_iter().map(|(_, device)| device).collect();
        }
        Ok(())
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            bail!("configuration must contain at least one device");
        }
        self.mqtt.validate()?;
        self.polling.validate()?;
        if self.discovery.enabled && self.discovery.prefix.trim_matches('/').is_empty() {
            bail!("discovery prefix must not be empty");
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

fn parse_millis(key: &str, value: &str) -> Result<Duration> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .with_context(|| format!("{} must be a number of milliseconds, got '{}'", key, value))
}

/// Broker connection settings.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default = "default_keep_alive")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub keep_alive: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_url: default_broker_url(),
            client_id: None,
            username: None,
            password: None,
            topic_prefix: default_topic_prefix(),
            keep_alive: default_keep_alive(),
        }
    }
}

/// Broker location and credentials resolved from [`MqttConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    /// `mqtts://` and `ssl://` URLs request TLS.
    pub tls: bool,
    /// Explicit `username`/`password` when set, otherwise the URL userinfo.
    pub credentials: Option<(String, String)>,
}

impl MqttConfig {
    /// Resolve the broker URL (`mqtt://`, `tcp://`, `mqtts://` or `ssl://`).
    ///
    /// The port defaults to 1883, or 8883 for TLS schemes. IPv6 literals
    /// are returned without brackets.
    pub fn endpoint(&self) -> Result<BrokerEndpoint> {
        let raw = self.broker_url.trim();
        let url = Url::parse(raw).with_context(|| format!("invalid broker url '{}'", raw))?;
        let (tls, default_port) = match url.scheme() {
            "mqtt" | "tcp" => (false, 1883),
            "mqtts" | "ssl" => (true, 8883),
            other => bail!(
                "unsupported broker url scheme '{}' in '{}': expected mqtt, tcp, mqtts or ssl",
                other,
                raw
            ),
        };
        let host = match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_owned(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            _ => bail!("broker url '{}' has no host", raw),
        };
        let port = url.port().unwrap_or(default_port);

        let credentials = match &self.username {
            Some(username) => Some((username.clone(), self.password.clone().unwrap_or_default())),
            None if !url.username().is_empty() => Some((
                decode_userinfo(url.username(), raw)?,
                decode_userinfo(url.password().unwrap_or_default(), raw)?,
            )),
            None => None,
        };
        Ok(BrokerEndpoint {
            host,
            port,
            tls,
            credentials,
        })
    }

    /// Client id, `hm2mqtt` when unset.
    pub fn effective_client_id(&self) -> String {
        match &self.client_id {
            Some(id) if !id.trim().is_empty() => id.trim().to_owned(),
            _ => default_topic_prefix(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.endpoint()?;
        if self.topic_prefix.trim().is_empty()
            || self.topic_prefix.contains(|c: char| c == '#' || c == '+')
        {
            bail!("topic_prefix '{}' is not a valid topic level", self.topic_prefix);
        }
        if self.password.is_some() && self.username.is_none() {
            bail!("mqtt password configured without a username");
        }
        Ok(())
    }
}

fn decode_userinfo(part: &str, url: &str) -> Result<String> {
    urlencoding::decode(part)
        .map(|decoded| decoded.into_owned())
        .with_context(|| format!("broker url '{}' has malformed credentials", url))
}

/// Entity discovery announcements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_discovery_enabled")]
    pub enabled: bool,
    /// Topic root discovery configs are published below.
    #[serde(default = "default_discovery_prefix")]
    pub prefix: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: default_discovery_enabled(),
            prefix: default_discovery_prefix(),
        }
    }
}

/// One bridged device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub family: String,
    pub id: String,
}

impl std::str::FromStr for DeviceConfig {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((family, id)) = s.trim().split_once(':') else {
            return Err(format!("device '{}' must use the form family:id", s));
        };
        let (family, id) = (family.trim(), id.trim());
        if family.is_empty() || id.is_empty() {
            return Err(format!("device '{}' has an empty family or id", s));
        }
        Ok(Self {
            family: family.to_owned(),
            id: id.to_owned(),
        })
    }
}

/// Polling cadence and response timeout.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub interval: Duration,
    #[serde(default = "default_slow_poll_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub slow_interval: Duration,
    #[serde(default = "default_response_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub response_timeout: Duration,
    #[serde(default = "default_stagger")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub stagger: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: default_poll_interval(),
            slow_interval: default_slow_poll_interval(),
            response_timeout: default_response_timeout(),
            stagger: default_stagger(),
        }
    }
}

impl PollingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() || self.slow_interval.is_zero() {
            bail!("polling intervals must be greater than zero");
        }
        if self.response_timeout.is_zero() {
            bail!("response timeout must be greater than zero");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for the rolling log file; stdout only when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}
