use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::{SystemTime, UNIX_EPOCH};

/// Message type discriminator inside the wire [`Envelope`].
///
/// Outbound (client-to-server): `Subscribe`, `Unsubscribe`, `Publish`,
/// `Heartbeat`, `Mutate`. Inbound (server-to-client): `Event`,
/// `HeartbeatAck`, `MutationConfirmed`, `MutationRejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// Register interest in a channel.
    Subscribe,
    /// Drop interest in a channel.
    Unsubscribe,
    /// Application payload on a channel.
    Publish,
    /// Liveness message emitted on a fixed interval while connected.
    Heartbeat,
    /// Optimistic mutation submission.
    Mutate,
    /// Server-pushed channel event.
    Event,
    /// Server acknowledgment of a heartbeat.
    HeartbeatAck,
    /// Server accepted a mutation; payload carries the authoritative entity.
    MutationConfirmed,
    /// Server declined a mutation; payload carries the rejection detail.
    MutationRejected,
    /// Forward-compatibility: any type this client version does not know.
    #[serde(other)]
    Unknown,
}

/// The wire message envelope carried as text frames over the WebSocket.
///
/// Logical shape: `{ "channel": string, "type": string, "payload": <opaque>,
/// "timestamp": number }`. The payload is opaque JSON whose meaning depends
/// on [`EnvelopeKind`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Named logical stream this message belongs to.
    pub channel: String,
    /// Message type discriminator.
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    /// Opaque JSON payload.
    #[serde(default)]
    pub payload: JsonValue,
    /// Millis since Unix epoch at the sender.
    pub timestamp: u64,
}

impl Envelope {
    /// Construct an envelope stamped with the current time.
    pub fn new(channel: impl Into<String>, kind: EnvelopeKind, payload: JsonValue) -> Self {
        Self {
            channel: channel.into(),
            kind,
            payload,
            timestamp: now_ms(),
        }
    }

    /// Channel subscription request.
    pub fn subscribe(channel: impl Into<String>) -> Self {
        Self::new(channel, EnvelopeKind::Subscribe, JsonValue::Null)
    }

    /// Channel unsubscription request.
    pub fn unsubscribe(channel: impl Into<String>) -> Self {
        Self::new(channel, EnvelopeKind::Unsubscribe, JsonValue::Null)
    }

    /// Application payload publication.
    pub fn publish(channel: impl Into<String>, payload: JsonValue) -> Self {
        Self::new(channel, EnvelopeKind::Publish, payload)
    }

    /// Liveness heartbeat. Carried on the reserved `system` channel.
    pub fn heartbeat() -> Self {
        Self::new("system", EnvelopeKind::Heartbeat, JsonValue::Null)
    }

    /// Serialize to the text frame representation.
    pub fn to_text(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse an inbound text frame.
    pub fn from_text(text: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Current time in millis since Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
