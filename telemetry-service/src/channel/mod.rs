//! Topic-addressed message channel: an MQTT adapter for production and an
//! in-process broker for tests and demo runs. Both expose the same
//! [`Publisher`] and [`Source`](crate::pipeline::Source) seams.

pub mod ack_order;
pub mod memory;
pub mod mqtt;

pub use memory::{MemoryBroker, MemorySubscription};
pub use mqtt::{MqttPublisher, MqttSubscription};

use crate::pipeline::{payload_digest, PipelineError};

/// A raw message as delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    pub fn digest(&self) -> String {
        payload_digest(&self.payload)
    }
}

impl AsRef<[u8]> for InboundMessage {
    fn as_ref(&self) -> &[u8] {
        &self.payload
    }
}

#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PipelineError>;
}

/// Consumer connection lifecycle.
///
/// `Disconnected -> Connecting -> Subscribed -> Consuming`, back to
/// `Disconnected` on any broker error. Messages are only handed on in `Consuming`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
    Consuming,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Subscribed => "subscribed",
            ConnectionState::Consuming => "consuming",
        }
    }

    /// Gauge value: 0 disconnected .. 3 consuming.
    pub fn level(&self) -> f64 {
        match self {
            ConnectionState::Disconnected => 0.0,
            ConnectionState::Connecting => 1.0,
            ConnectionState::Subscribed => 2.0,
            ConnectionState::Consuming => 3.0,
        }
    }
}

/// MQTT topic filter matching: `+` matches one level, a trailing `#` matches the rest.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
