//! The sync protocol engine.
//!
//! Consumes every inbound frame a session produces and owns the push side
//! (`trigger_sync`, `push_config_update`, `broadcast_config_update`) that
//! the CRUD layer calls after appending diffs.
//!
//! Recovery is pull-based: nothing is queued for an offline node. On
//! reconnect the slave's `sync_request` carries its persisted version and
//! the engine streams everything strictly greater, in ascending order;
//! that resumability is the correctness anchor of the whole design.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};
use xfleet_protocol::{
    AckPayload, AckStatus, ConfigAction, ConfigDiffPayload, ErrorPayload, Frame, MessageType,
    PongPayload, ProtocolError, ReportIpPayload, SyncRequestPayload, TrafficReportPayload,
    XrayStatusPayload,
};
use xfleet_store::{NodeStatus, Store, StoreError};

use crate::hub::{Hub, Session};

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("node {0} is not online")]
    NodeOffline(i64),

    /// The session's send queue is full or closed; it has been evicted.
    #[error("session for node {0} is dead")]
    SessionDead(i64),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct SyncEngine {
    store: Arc<Store>,
    hub: Arc<Hub>,
}

impl SyncEngine {
    pub fn new(store: Arc<Store>, hub: Arc<Hub>) -> Self {
        Self { store, hub }
    }

    /// Dispatch one inbound frame. Protocol errors are logged and the frame
    /// dropped; the session lives on.
    pub async fn handle_frame(&self, session: &Session, frame: Frame) {
        debug!(
            session_id = %session.id(),
            node_id = session.node_id(),
            frame_type = %frame.frame_type,
            "frame received"
        );
        let result = match frame.frame_type {
            MessageType::SyncRequest => self.handle_sync_request(session, &frame).await,
            MessageType::Ack => self.handle_ack(session, &frame),
            MessageType::Ping => self.handle_ping(session, &frame),
            MessageType::TrafficReport => self.handle_traffic_report(session, &frame),
            MessageType::ReportIp => self.handle_report_ip(session, &frame),
            MessageType::XrayStatus => self.handle_xray_status(session, &frame),
            other => {
                warn!(frame_type = %other, "unexpected frame type from slave");
                Ok(())
            }
        };
        if let Err(err) = result {
            warn!(
                node_id = session.node_id(),
                %err,
                "frame handling failed"
            );
            if matches!(err, SyncError::SessionDead(_)) {
                self.hub.unregister(session.id()).await;
            }
        }
    }

    async fn handle_sync_request(&self, session: &Session, frame: &Frame) -> SyncResult<()> {
        let payload: SyncRequestPayload = match frame.payload() {
            Ok(payload) => payload,
            Err(err) => return self.reject(session, err),
        };
        let node_id = session.node_id();
        let latest = self.store.latest_version(node_id)?;
        info!(
            node_id,
            local_version = payload.local_version,
            latest,
            "sync requested"
        );

        if payload.local_version >= latest {
            self.send(
                session,
                ack_frame(
                    AckPayload::status(AckStatus::UpToDate)
                        .with_version(latest)
                        .with_message("configuration is current"),
                ),
            )?;
        } else {
            let diffs = self.store.list_diffs_after(node_id, payload.local_version)?;
            let count = diffs.len();
            for diff in diffs {
                self.send(
                    session,
                    Frame::with_payload(
                        MessageType::ConfigDiff,
                        &ConfigDiffPayload {
                            version: diff.version,
                            action: diff.action,
                            content: diff.content,
                        },
                    ),
                )?;
            }
            self.send(
                session,
                ack_frame(
                    AckPayload::status(AckStatus::SyncComplete)
                        .with_version(latest)
                        .with_diffs_applied(count)
                        .with_message(format!("streamed {count} configuration diffs")),
                ),
            )?;
            info!(node_id, count, latest, "sync stream complete");
        }

        self.store.update_node_version(node_id, latest)?;
        self.store.update_node_status(node_id, NodeStatus::Online)?;
        Ok(())
    }

    /// The slave acknowledged applying up through `version`; persist it.
    fn handle_ack(&self, session: &Session, frame: &Frame) -> SyncResult<()> {
        let payload: AckPayload = match frame.payload() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%err, "dropping malformed ack");
                return Ok(());
            }
        };
        if let Some(version) = payload.version {
            debug!(node_id = session.node_id(), version, status = %payload.status, "ack");
            self.store.update_node_version(session.node_id(), version)?;
        }
        Ok(())
    }

    fn handle_ping(&self, session: &Session, frame: &Frame) -> SyncResult<()> {
        self.send(
            session,
            Frame::with_payload(
                MessageType::Pong,
                &PongPayload {
                    timestamp: Some(frame.timestamp),
                },
            ),
        )?;
        self.store
            .update_node_status(session.node_id(), NodeStatus::Online)?;
        Ok(())
    }

    /// The report carries window deltas, not totals; each entry becomes one
    /// atomic upsert-add.
    fn handle_traffic_report(&self, session: &Session, frame: &Frame) -> SyncResult<()> {
        let payload: TrafficReportPayload = match frame.payload() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%err, "dropping malformed traffic report");
                return Ok(());
            }
        };
        let node_id = session.node_id();
        let entries = payload.traffic.len();
        for (tag, sample) in &payload.traffic {
            if let Err(err) =
                self.store
                    .add_traffic(node_id, tag, sample.uplink, sample.downlink)
            {
                warn!(node_id, tag = %tag, %err, "traffic upsert failed");
            }
        }
        self.send(
            session,
            ack_frame(
                AckPayload::status(AckStatus::TrafficReceived)
                    .with_message(format!("received traffic for {entries} ingresses")),
            ),
        )?;
        Ok(())
    }

    fn handle_report_ip(&self, session: &Session, frame: &Frame) -> SyncResult<()> {
        let payload: ReportIpPayload = match frame.payload() {
            Ok(payload) => payload,
            Err(err) => return self.reject(session, err),
        };
        info!(node_id = session.node_id(), ip = %payload.ip, "node reported ip");
        self.store.update_node_ip(session.node_id(), &payload.ip)?;
        self.send(
            session,
            ack_frame(AckPayload::status(AckStatus::Success).with_message("ip recorded")),
        )?;
        Ok(())
    }

    fn handle_xray_status(&self, session: &Session, frame: &Frame) -> SyncResult<()> {
        let payload: XrayStatusPayload = match frame.payload() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%err, "dropping malformed xray status");
                return Ok(());
            }
        };
        debug!(node_id = session.node_id(), status = %payload.status, "xray status");
        self.store
            .update_node_xray_status(session.node_id(), &payload.status)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Push side, called by the CRUD layer after appending diffs
    // ------------------------------------------------------------------

    /// Push every diff the node has not acknowledged yet, then the closing
    /// ack. Errors with [`SyncError::NodeOffline`] when the node has no
    /// session; nothing is queued, the node pulls on reconnect.
    pub async fn trigger_sync(&self, node_id: i64) -> SyncResult<()> {
        let session = self
            .hub
            .get_by_node(node_id)
            .ok_or(SyncError::NodeOffline(node_id))?;
        let node = self.store.get_node(node_id)?;
        let diffs = self.store.list_diffs_after(node_id, node.current_version)?;

        if diffs.is_empty() {
            self.send(
                &session,
                ack_frame(
                    AckPayload::status(AckStatus::UpToDate)
                        .with_version(node.current_version)
                        .with_message("configuration is current"),
                ),
            )?;
            return Ok(());
        }

        let count = diffs.len();
        let latest = diffs.last().map(|d| d.version).unwrap_or(node.current_version);
        for diff in diffs {
            self.send(
                &session,
                Frame::with_payload(
                    MessageType::ConfigDiff,
                    &ConfigDiffPayload {
                        version: diff.version,
                        action: diff.action,
                        content: diff.content,
                    },
                ),
            )?;
        }
        self.send(
            &session,
            ack_frame(
                AckPayload::status(AckStatus::SyncComplete)
                    .with_version(latest)
                    .with_diffs_applied(count)
                    .with_message(format!("streamed {count} configuration diffs")),
            ),
        )?;
        info!(node_id, count, "sync pushed");
        Ok(())
    }

    /// Push a single diff to one node.
    pub async fn push_config_update(
        &self,
        node_id: i64,
        version: i64,
        action: ConfigAction,
        content: Value,
    ) -> SyncResult<()> {
        let session = self
            .hub
            .get_by_node(node_id)
            .ok_or(SyncError::NodeOffline(node_id))?;
        self.send(
            &session,
            Frame::with_payload(
                MessageType::ConfigDiff,
                &ConfigDiffPayload {
                    version,
                    action,
                    content,
                },
            ),
        )?;
        info!(node_id, version, %action, "config update pushed");
        Ok(())
    }

    /// Best-effort fan-out of one diff to every connected node.
    pub async fn broadcast_config_update(
        &self,
        version: i64,
        action: ConfigAction,
        content: Value,
    ) {
        self.hub
            .broadcast(Frame::with_payload(
                MessageType::ConfigDiff,
                &ConfigDiffPayload {
                    version,
                    action,
                    content,
                },
            ))
            .await;
        info!(version, %action, "config update broadcast");
    }

    fn send(&self, session: &Session, frame: Frame) -> SyncResult<()> {
        session
            .send(frame)
            .map_err(|_| SyncError::SessionDead(session.node_id()))
    }

    /// Report a malformed frame back to the slave and keep the session.
    fn reject(&self, session: &Session, err: ProtocolError) -> SyncResult<()> {
        warn!(node_id = session.node_id(), %err, "rejecting malformed frame");
        self.send(
            session,
            Frame::with_payload(
                MessageType::Error,
                &ErrorPayload {
                    error: err.to_string(),
                },
            ),
        )
    }
}

fn ack_frame(payload: AckPayload) -> Frame {
    Frame::with_payload(MessageType::Ack, &payload)
}
