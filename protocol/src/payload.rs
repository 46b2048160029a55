//! Typed payloads for every message the protocol defines.
//!
//! The `config_diff` content stays an open JSON object on the wire (the
//! master does not know the proxy engine's schema); [`ConfigKind::classify`]
//! is the field-presence rule the slave uses to type it.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Diff vocabulary
// ============================================================================

/// Operation carried by a configuration diff.
///
/// The wire (and the master's diff log) use `ADD` / `UPDATE` / `DEL`;
/// `DELETE` is accepted as a legacy alias on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigAction {
    #[serde(rename = "ADD")]
    Add,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DEL", alias = "DELETE")]
    Delete,
}

impl ConfigAction {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::Update => "UPDATE",
            Self::Delete => "DEL",
        }
    }
}

impl fmt::Display for ConfigAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which section of the proxy configuration a diff targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigKind {
    Inbound,
    Outbound,
    Routing,
    Balancer,
}

impl ConfigKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
            Self::Routing => "routing",
            Self::Balancer => "balancer",
        }
    }

    /// Classify an open diff payload by field presence.
    ///
    /// The wire format does not carry the kind explicitly, so this rule is
    /// load-bearing: `port` wins over everything (inbounds also carry
    /// `protocol`), `outboundTag` marks a routing rule, `selector` a
    /// balancer, and a bare `protocol` an outbound.
    pub fn classify(content: &Value) -> Option<Self> {
        let obj = content.as_object()?;
        if obj.contains_key("port") {
            Some(Self::Inbound)
        } else if obj.contains_key("outboundTag") {
            Some(Self::Routing)
        } else if obj.contains_key("selector") {
            Some(Self::Balancer)
        } else if obj.contains_key("protocol") {
            Some(Self::Outbound)
        } else {
            None
        }
    }

    /// The field that keys UPDATE/DELETE for this kind.
    ///
    /// Routing rules have no `tag`; their `outboundTag` serves as one.
    pub fn tag_of(self, content: &Value) -> Option<&str> {
        let field = match self {
            Self::Routing => "outboundTag",
            _ => "tag",
        };
        content.get(field).and_then(Value::as_str)
    }
}

impl fmt::Display for ConfigKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Message payloads
// ============================================================================

/// `auth`: master → slave handshake outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthPayload {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AuthPayload {
    pub const STATUS_SUCCESS: &'static str = "success";
    pub const STATUS_FAILURE: &'static str = "failure";

    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: Self::STATUS_SUCCESS.to_string(),
            message: Some(message.into()),
        }
    }
}

/// `sync_request`: slave → master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequestPayload {
    pub local_version: i64,
}

/// `config_diff`: master → slave.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigDiffPayload {
    pub version: i64,
    pub action: ConfigAction,
    pub content: Value,
}

/// Well-known `ack.status` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    UpToDate,
    SyncComplete,
    Success,
    Error,
    TrafficReceived,
}

impl AckStatus {
    pub const UP_TO_DATE: &'static str = "up_to_date";
    pub const SYNC_COMPLETE: &'static str = "sync_complete";
    pub const SUCCESS: &'static str = "success";
    pub const ERROR: &'static str = "error";
    pub const TRAFFIC_RECEIVED: &'static str = "traffic_received";

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UpToDate => Self::UP_TO_DATE,
            Self::SyncComplete => Self::SYNC_COMPLETE,
            Self::Success => Self::SUCCESS,
            Self::Error => Self::ERROR,
            Self::TrafficReceived => Self::TRAFFIC_RECEIVED,
        }
    }
}

impl fmt::Display for AckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `ack`: both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diffs_applied: Option<usize>,
}

impl AckPayload {
    pub fn status(status: AckStatus) -> Self {
        Self {
            version: None,
            status: status.as_str().to_string(),
            message: None,
            diffs_applied: None,
        }
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_diffs_applied(mut self, count: usize) -> Self {
        self.diffs_applied = Some(count);
        self
    }
}

/// `error`: master → slave.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
}

/// `pong`: optional echo of the ping's timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PongPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// One ingress entry of a traffic report. Values are window deltas in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSample {
    pub uplink: i64,
    pub downlink: i64,
}

/// `traffic_report`: slave → master, one frame per reporting window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficReportPayload {
    pub traffic: HashMap<String, TrafficSample>,
}

/// `report_ip`: slave → master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportIpPayload {
    pub ip: String,
}

/// `xray_status`: slave → master, opaque proxy-process status string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XrayStatusPayload {
    pub status: String,
}
