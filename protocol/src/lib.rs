//! Wire protocol shared by the xfleet master and slave.
//!
//! Everything that crosses the WebSocket link is a single JSON text frame:
//!
//! ```json
//! { "type": "sync_request", "timestamp": 1735689600, "data": { "local_version": 3 } }
//! ```
//!
//! This crate owns:
//! - [`Frame`] and [`MessageType`]: the envelope
//! - Typed payload structs for every message the protocol defines
//! - [`ConfigAction`] / [`ConfigKind`]: the diff vocabulary, including the
//!   field-presence classification used by the slave projector

mod frame;
mod payload;

pub use frame::{unix_timestamp, Frame, MessageType, ProtocolError};
pub use payload::{
    AckPayload, AckStatus, AuthPayload, ConfigAction, ConfigDiffPayload, ConfigKind, ErrorPayload,
    PongPayload, ReportIpPayload, SyncRequestPayload, TrafficReportPayload, TrafficSample,
    XrayStatusPayload,
};
