//! The JSON frame envelope and message-type vocabulary.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame {frame_type} carries an invalid payload: {source}")]
    InvalidPayload {
        frame_type: MessageType,
        #[source]
        source: serde_json::Error,
    },
}

/// Discriminator for every frame crossing the link.
///
/// The serialized form is the snake_case tag in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// master → slave, handshake outcome
    Auth,
    /// slave → master, pull request carrying the slave's persisted version
    SyncRequest,
    /// master → slave, one versioned configuration change
    ConfigDiff,
    /// both directions, status acknowledgement
    Ack,
    /// master → slave, protocol-level error report
    Error,
    Ping,
    Pong,
    /// slave → master, aggregated per-ingress traffic deltas
    TrafficReport,
    /// slave → master, detected public-facing IP
    ReportIp,
    /// slave → master, opaque proxy-process status
    XrayStatus,
}

impl MessageType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::SyncRequest => "sync_request",
            Self::ConfigDiff => "config_diff",
            Self::Ack => "ack",
            Self::Error => "error",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::TrafficReport => "traffic_report",
            Self::ReportIp => "report_ip",
            Self::XrayStatus => "xray_status",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Seconds since the Unix epoch, the protocol's only notion of time.
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// A single wire frame: `{ type, timestamp, data }`.
///
/// `data` stays an open [`Value`] at this layer; callers extract a typed
/// payload with [`Frame::payload`] at the point where the shape matters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: MessageType,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Frame {
    pub fn new(frame_type: MessageType, data: Value) -> Self {
        Self {
            frame_type,
            timestamp: unix_timestamp(),
            data,
        }
    }

    /// Build a frame from a typed payload.
    ///
    /// Serialization of a payload struct cannot fail, so this is infallible.
    pub fn with_payload<T: Serialize>(frame_type: MessageType, payload: &T) -> Self {
        let data = serde_json::to_value(payload).unwrap_or(Value::Null);
        Self::new(frame_type, data)
    }

    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_json(&self) -> String {
        // A Frame is a plain data tree; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Extract the typed payload for this frame.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.data.clone()).map_err(|source| ProtocolError::InvalidPayload {
            frame_type: self.frame_type,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::SyncRequestPayload;

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::with_payload(
            MessageType::SyncRequest,
            &SyncRequestPayload { local_version: 7 },
        );
        let parsed = Frame::parse(&frame.to_json()).unwrap();
        assert_eq!(parsed.frame_type, MessageType::SyncRequest);
        let payload: SyncRequestPayload = parsed.payload().unwrap();
        assert_eq!(payload.local_version, 7);
    }

    #[test]
    fn test_message_type_wire_tags() {
        assert_eq!(MessageType::SyncRequest.as_str(), "sync_request");
        assert_eq!(MessageType::ConfigDiff.as_str(), "config_diff");
        assert_eq!(MessageType::TrafficReport.as_str(), "traffic_report");
        assert_eq!(MessageType::ReportIp.as_str(), "report_ip");
        assert_eq!(MessageType::XrayStatus.as_str(), "xray_status");

        // serde tag and as_str must agree
        let tagged = serde_json::to_value(MessageType::SyncRequest).unwrap();
        assert_eq!(tagged, serde_json::json!("sync_request"));
    }

    #[test]
    fn test_unknown_type_is_malformed() {
        let raw = r#"{"type":"teleport","timestamp":0,"data":{}}"#;
        assert!(matches!(
            Frame::parse(raw),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_missing_data_defaults_to_null() {
        let raw = r#"{"type":"ping","timestamp":12}"#;
        let frame = Frame::parse(raw).unwrap();
        assert!(frame.data.is_null());
    }
}
