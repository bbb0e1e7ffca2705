//! Event and message types shared between stations and the manager.
//!
//! Every station feeds the same aggregated sink, so each event carries the
//! originating station id. The six kinds mirror what a single connection
//! reports: connect, disconnect, reconnect, offline, error and message.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::warn;

use crate::error::StationError;
use crate::topic::device_id_from_topic;

/// Unique key of one managed station.
pub type StationId = String;

/// Result returned by a message callback. A failing callback is logged and
/// never blocks delivery to sibling callbacks.
pub type CallbackResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// A caller-supplied handler for inbound messages.
pub type MessageCallback = dyn Fn(&MessageEnvelope) -> CallbackResult + Send + Sync;

/// Shared handle to a message callback. Callback identity (used for set
/// deduplication and targeted unsubscribe) is `Arc` pointer identity.
pub type SharedCallback = Arc<MessageCallback>;

/// Wraps a closure into a [`SharedCallback`].
pub fn callback<F>(f: F) -> SharedCallback
where
    F: Fn(&MessageEnvelope) -> CallbackResult + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Body of an MQTT message, inbound or outbound.
///
/// Outbound: `Text` passes through unchanged, `Json` is encoded as JSON
/// text. Inbound: payloads that parse as JSON become `Json`, anything else
/// is delivered as raw `Text`.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Json(serde_json::Value),
}

impl Payload {
    /// Encodes the payload to its transport wire form.
    pub fn to_wire(&self) -> Result<Vec<u8>, StationError> {
        match self {
            Payload::Text(text) => Ok(text.clone().into_bytes()),
            Payload::Json(value) => Ok(serde_json::to_vec(value)?),
        }
    }

    /// Builds a JSON payload from any serializable value.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self, StationError> {
        Ok(Payload::Json(serde_json::to_value(value)?))
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_owned())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Json(value)
    }
}

/// One inbound message, annotated for delivery to handlers.
#[derive(Debug, Clone)]
pub struct MessageEnvelope {
    pub topic: String,
    pub payload: Payload,
    pub station_id: StationId,
    /// Second topic segment, present only when the payload parsed as JSON
    /// and the topic has at least two segments.
    pub device_id: Option<String>,
    pub received_at: DateTime<Local>,
}

impl MessageEnvelope {
    /// Decodes a raw wire payload into an envelope.
    ///
    /// A payload that fails to parse as JSON is still delivered, as raw
    /// text without device annotation. Malformed telemetry is a logging
    /// matter, not a delivery failure.
    pub fn from_wire(station_id: &str, topic: &str, payload: &[u8]) -> Self {
        let text = String::from_utf8_lossy(payload).into_owned();
        let (payload, device_id) = match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(value) => (
                Payload::Json(value),
                device_id_from_topic(topic).map(str::to_owned),
            ),
            Err(err) => {
                warn!(station_id, topic, %err, "inbound payload is not valid JSON, delivering raw text");
                (Payload::Text(text), None)
            }
        };
        MessageEnvelope {
            topic: topic.to_owned(),
            payload,
            station_id: station_id.to_owned(),
            device_id,
            received_at: Local::now(),
        }
    }
}

impl fmt::Display for MessageEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}] {}", self.station_id, self.topic)
    }
}

/// Station lifecycle and message events, tagged with the originating
/// station.
#[derive(Debug, Clone)]
pub enum StationEvent {
    Connect { station_id: StationId },
    Disconnect { station_id: StationId },
    Reconnect { station_id: StationId },
    Offline { station_id: StationId },
    Error { station_id: StationId, error: String },
    Message(MessageEnvelope),
}

impl StationEvent {
    /// The station this event originated from.
    pub fn station_id(&self) -> &str {
        match self {
            StationEvent::Connect { station_id }
            | StationEvent::Disconnect { station_id }
            | StationEvent::Reconnect { station_id }
            | StationEvent::Offline { station_id }
            | StationEvent::Error { station_id, .. } => station_id,
            StationEvent::Message(envelope) => &envelope.station_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_round_trip_preserves_json_exactly() {
        let payload = Payload::Json(json!({"command": "REBOOT"}));
        let wire = payload.to_wire().unwrap();
        let decoded: serde_json::Value = serde_json::from_slice(&wire).unwrap();
        assert_eq!(decoded, json!({"command": "REBOOT"}));
    }

    #[test]
    fn text_passes_through_unchanged() {
        let payload = Payload::from("plain text");
        assert_eq!(payload.to_wire().unwrap(), b"plain text".to_vec());
    }

    #[test]
    fn json_envelope_gets_device_annotation() {
        let envelope =
            MessageEnvelope::from_wire("station-1", "devices/ABC123/data", b"{\"temp\": 21.5}");
        assert_eq!(envelope.station_id, "station-1");
        assert_eq!(envelope.device_id.as_deref(), Some("ABC123"));
        assert_eq!(envelope.payload, Payload::Json(json!({"temp": 21.5})));
    }

    #[test]
    fn malformed_payload_is_delivered_raw_without_annotation() {
        let envelope = MessageEnvelope::from_wire("station-1", "devices/ABC123/data", b"not json");
        assert_eq!(envelope.payload, Payload::Text("not json".to_owned()));
        assert_eq!(envelope.device_id, None);
    }

    #[test]
    fn short_topic_gets_no_device_annotation() {
        let envelope = MessageEnvelope::from_wire("station-1", "heartbeat", b"{}");
        assert_eq!(envelope.device_id, None);
    }
}
