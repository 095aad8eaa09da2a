//! ---
//! hm_section: "04-transport"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Transport abstraction and adapters."
//! hm_version: "v0.1.0"
//! hm_owner: "tbd"
//! ---
//! Publish/subscribe transport used by the bridge.
//!
//! The bridge only needs fire-and-forget publishing and topic
//! subscriptions; inbound messages arrive through an `mpsc` channel fed by
//! the adapter's event pump.
#![warn(missing_docs)]

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

pub mod mqtt;
pub mod topics;

pub use mqtt::{pump_events, MqttSettings, MqttTransport};
pub use topics::{DeviceTopics, TopicRoute};

/// Errors raised by transports.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The outgoing queue is full or the connection task is gone.
    #[error("transport '{transport}' rejected publish to '{topic}': {reason}")]
    Rejected {
        /// Transport name.
        transport: &'static str,
        /// Target topic.
        topic: String,
        /// Adapter specific reason.
        reason: String,
    },
    /// A subscription request could not be queued.
    #[error("transport '{transport}' rejected subscription '{filter}': {reason}")]
    SubscribeFailed {
        /// Transport name.
        transport: &'static str,
        /// Topic filter.
        filter: String,
        /// Adapter specific reason.
        reason: String,
    },
}

/// Delivery guarantee requested for a publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QoS {
    /// Fire and forget.
    AtMostOnce,
    /// Acknowledged delivery.
    #[default]
    AtLeastOnce,
}

/// One outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    /// Target topic.
    pub topic: String,
    /// UTF-8 payload.
    pub payload: String,
    /// Whether the broker should retain the message.
    pub retain: bool,
    /// Delivery guarantee.
    pub qos: QoS,
}

impl Publication {
    /// Non-retained publication with at-least-once delivery.
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
            qos: QoS::default(),
        }
    }

    /// Mark the publication as retained.
    pub fn retained(mut self) -> Self {
        self.retain = true;
        self
    }
}

/// One incoming message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic the message arrived on.
    pub topic: String,
    /// Payload, lossily decoded as UTF-8.
    pub payload: String,
}

impl InboundMessage {
    /// Build an inbound message.
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Transport abstraction used by the bridge.
pub trait Transport: Send + Sync {
    /// Queue a publication without waiting for delivery.
    fn publish(&self, publication: Publication) -> Result<(), TransportError>;
    /// Subscribe to a topic filter; adapters re-subscribe after reconnects.
    fn subscribe(&self, filter: &str) -> Result<(), TransportError>;
    /// Human-readable transport name for logging/metrics.
    fn name(&self) -> &'static str;
}

#[derive(Debug, Default)]
struct InMemoryState {
    publications: Vec<Publication>,
    subscriptions: Vec<String>,
    rejecting: bool,
}

/// In-memory transport recording every publication, used by tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTransport {
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryTransport {
    /// Create a new in-memory transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all publications so far.
    pub fn publications(&self) -> Vec<Publication> {
        self.state.lock().publications.clone()
    }

    /// Publications sent to `topic`.
    pub fn published_to(&self, topic: &str) -> Vec<Publication> {
        self.state
            .lock()
            .publications
            .iter()
            .filter(|publication| publication.topic == topic)
            .cloned()
            .collect()
    }

    /// Drain recorded publications.
    pub fn take(&self) -> Vec<Publication> {
        std::mem::take(&mut self.state.lock().publications)
    }

    /// Subscribed topic filters in request order.
    pub fn subscriptions(&self) -> Vec<String> {
        self.state.lock().subscriptions.clone()
    }

    /// Make subsequent publishes fail, emulating a saturated client queue.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.state.lock().rejecting = rejecting;
    }
}

impl Transport for InMemoryTransport {
    fn publish(&self, publication: Publication) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.rejecting {
            return Err(TransportError::Rejected {
                transport: self.name(),
                topic: publication.topic,
                reason: "rejecting publishes".to_owned(),
            });
        }
        state.publications.push(publication);
        Ok(())
    }

    fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.subscriptions.iter().any(|existing| existing == filter) {
            state.subscriptions.push(filter.to_owned());
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}
