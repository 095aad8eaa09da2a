//! ---
//! hm_section: "04-transport"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Transport abstraction and adapters."
//! hm_version: "v0.1.0"
//! hm_owner: "tbd"
//! ---
//! MQTT adapter over `rumqttc`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::{InboundMessage, Publication, QoS, Transport, TransportError};

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(3);

/// Connection parameters for [`MqttTransport::connect`].
#[derive(Debug, Clone)]
pub struct MqttSettings {
    /// Broker host name or address.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Connect over TLS using the platform root certificates.
    pub tls: bool,
    /// MQTT client id.
    pub client_id: String,
    /// Optional username/password pair.
    pub credentials: Option<(String, String)>,
    /// Keep-alive interval.
    pub keep_alive: Duration,
    /// Last will registered with the broker.
    pub last_will: Option<Publication>,
    /// Publication repeated after every (re)connect, typically the
    /// counterpart of the last will.
    pub birth: Option<Publication>,
    /// Capacity of the client request queue.
    pub capacity: usize,
}

impl MqttSettings {
    /// Settings with defaults for everything but the endpoint and client id.
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            tls: false,
            client_id: client_id.into(),
            credentials: None,
            keep_alive: Duration::from_secs(30),
            last_will: None,
            birth: None,
            capacity: 256,
        }
    }
}

fn qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
    }
}

/// [`Transport`] backed by a `rumqttc` client.
///
/// Publishing never blocks: requests go through `try_publish` and fail when
/// the request queue is full. The paired [`EventLoop`] must be driven by
/// [`pump_events`].
#[derive(Clone)]
pub struct MqttTransport {
    client: AsyncClient,
    subscriptions: Arc<Mutex<Vec<String>>>,
    birth: Option<Publication>,
}

impl MqttTransport {
    /// Create the client and its event loop. No network I/O happens until the
    /// event loop is polled.
    pub fn connect(settings: MqttSettings) -> (Self, EventLoop) {
        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(settings.keep_alive);
        options.set_clean_session(true);
        if let Some((username, password)) = &settings.credentials {
            options.set_credentials(username, password);
        }
        if settings.tls {
            options.set_transport(rumqttc::Transport::tls_with_default_config());
        }
        if let Some(will) = &settings.last_will {
            options.set_last_will(LastWill::new(
                &will.topic,
                will.payload.clone(),
                qos(will.qos),
                will.retain,
            ));
        }
        info!(
            host = %settings.host,
            port = settings.port,
            tls = settings.tls,
            client_id = %settings.client_id,
            authenticated = settings.credentials.is_some(),
            "configuring mqtt client"
        );
        let (client, eventloop) = AsyncClient::new(options, settings.capacity);
        (
            Self {
                client,
                subscriptions: Arc::new(Mutex::new(Vec::new())),
                birth: settings.birth,
            },
            eventloop,
        )
    }

    fn on_connected(&self) {
        let filters = self.subscriptions.lock().clone();
        info!(subscriptions = filters.len(), "mqtt connected; subscribing");
        for filter in filters {
            if let Err(err) = self.client.try_subscribe(&filter, rumqttc::QoS::AtLeastOnce) {
                error!(%filter, error = %err, "failed to re-subscribe");
            }
        }
        if let Some(birth) = self.birth.clone() {
            if let Err(err) = self.publish(birth) {
                warn!(error = %err, "failed to publish birth message");
            }
        }
    }
}

impl Transport for MqttTransport {
    fn publish(&self, publication: Publication) -> Result<(), TransportError> {
        self.client
            .try_publish(
                &publication.topic,
                qos(publication.qos),
                publication.retain,
                publication.payload.into_bytes(),
            )
            .map_err(|err| TransportError::Rejected {
                transport: "mqtt",
                topic: publication.topic.clone(),
                reason: err.to_string(),
            })
    }

    fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        {
            let mut subscriptions = self.subscriptions.lock();
            if !subscriptions.iter().any(|existing| existing == filter) {
                subscriptions.push(filter.to_owned());
            }
        }
        self.client
            .try_subscribe(filter, rumqttc::QoS::AtLeastOnce)
            .map_err(|err| TransportError::SubscribeFailed {
                transport: "mqtt",
                filter: filter.to_owned(),
                reason: err.to_string(),
            })
    }

    fn name(&self) -> &'static str {
        "mqtt"
    }
}

/// Drive the MQTT event loop until shutdown or until the inbound channel closes.
///
/// Every `ConnAck` re-subscribes all known filters (the client does not do
/// it on its own) and repeats the birth publication. Connection errors are
/// logged and retried after a short back-off. On shutdown the loop keeps
/// polling until the queued requests and the DISCONNECT are written.
pub async fn pump_events(
    mut eventloop: EventLoop,
    transport: MqttTransport,
    inbound: mpsc::Sender<InboundMessage>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("mqtt event pump shutting down");
                match transport.client.try_disconnect() {
                    Ok(()) => flush_until_disconnected(&mut eventloop).await,
                    Err(err) => warn!(error = %err, "disconnect request not queued"),
                }
                break;
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => transport.on_connected(),
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = InboundMessage {
                        topic: publish.topic.clone(),
                        payload: String::from_utf8_lossy(&publish.payload).into_owned(),
                    };
                    debug!(
                        topic = %message.topic,
                        payload = %message.payload,
                        "mqtt message received"
                    );
                    if inbound.send(message).await.is_err() {
                        info!("inbound channel closed; stopping mqtt event pump");
                        break;
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    error!(error = %err, "mqtt event loop error");
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                }
            },
        }
    }
}

async fn flush_until_disconnected(eventloop: &mut EventLoop) {
    let flushed = tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => return true,
                Ok(_) => {}
                Err(err) => {
                    debug!(error = %err, "mqtt connection closed while flushing");
                    return false;
                }
            }
        }
    })
    .await;
    match flushed {
        Ok(true) => info!("mqtt disconnect sent"),
        Ok(false) => warn!("mqtt connection lost before disconnect"),
        Err(_) => warn!(
            timeout_ms = DISCONNECT_FLUSH_TIMEOUT.as_millis() as u64,
            "timed out flushing mqtt requests"
        ),
    }
}
