//! The agent's reaction to each frame the master sends.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};
use xfleet_protocol::{
    AckPayload, AckStatus, AuthPayload, ConfigDiffPayload, ErrorPayload, Frame, MessageType,
};

use crate::client::{ClientHandler, MasterClient};
use crate::version::VersionStore;
use crate::xray::{ConfigManager, XrayInstance};

pub struct SlaveAgent {
    client: Arc<MasterClient>,
    manager: Arc<ConfigManager>,
    version: Arc<VersionStore>,
    instance: Arc<XrayInstance>,
}

impl SlaveAgent {
    pub fn new(
        client: Arc<MasterClient>,
        manager: Arc<ConfigManager>,
        version: Arc<VersionStore>,
        instance: Arc<XrayInstance>,
    ) -> Self {
        Self {
            client,
            manager,
            version,
            instance,
        }
    }

    async fn handle_auth(&self, frame: Frame) {
        let Ok(payload) = frame.payload::<AuthPayload>() else {
            warn!("malformed auth frame");
            return;
        };
        info!(
            status = %payload.status,
            message = payload.message.as_deref().unwrap_or(""),
            "authentication response"
        );
        if payload.status == AuthPayload::STATUS_SUCCESS {
            let status = self.instance.status_label().await;
            if let Err(err) = self.client.report_xray_status(status).await {
                warn!(%err, "failed to report xray status");
            }
        }
    }

    /// Apply one diff: project it onto the configuration (reloading the
    /// engine if anything changed), persist the version, ack. On any
    /// failure the version does not advance and the master learns via an
    /// error ack, and will replay the same diff later.
    async fn handle_config_diff(&self, frame: Frame) {
        let payload: ConfigDiffPayload = match frame.payload() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%err, "malformed config_diff frame");
                return;
            }
        };
        info!(
            version = payload.version,
            action = %payload.action,
            "configuration diff received"
        );

        match self.manager.apply_diff(payload.action, &payload.content).await {
            Ok(modified) => {
                if let Err(err) = self.version.update(payload.version) {
                    error!(%err, version = payload.version, "failed to persist version");
                    let _ = self
                        .client
                        .send_ack(
                            payload.version,
                            AckStatus::Error,
                            format!("failed to persist version: {err}"),
                        )
                        .await;
                    return;
                }
                debug!(version = payload.version, modified, "diff applied");

                let status = self.instance.status_label().await;
                if let Err(err) = self.client.report_xray_status(status).await {
                    warn!(%err, "failed to report xray status");
                }
                if let Err(err) = self
                    .client
                    .send_ack(payload.version, AckStatus::Success, "configuration applied")
                    .await
                {
                    warn!(%err, "failed to ack diff");
                }
            }
            Err(err) => {
                error!(%err, version = payload.version, "failed to apply diff");
                let _ = self
                    .client
                    .send_ack(payload.version, AckStatus::Error, err.to_string())
                    .await;
            }
        }
    }

    fn handle_ack(&self, frame: Frame) {
        let Ok(payload) = frame.payload::<AckPayload>() else {
            warn!("malformed ack frame");
            return;
        };
        match payload.status.as_str() {
            AckStatus::UP_TO_DATE => {
                info!(version = payload.version.unwrap_or(0), "configuration is current")
            }
            AckStatus::SYNC_COMPLETE => info!(
                version = payload.version.unwrap_or(0),
                diffs_applied = payload.diffs_applied.unwrap_or(0),
                "sync complete"
            ),
            status => debug!(status, message = payload.message.as_deref().unwrap_or(""), "ack"),
        }
    }
}

#[async_trait]
impl ClientHandler for SlaveAgent {
    /// The post-connect sequence: best-effort identity reports, then the
    /// pull that brings this node current.
    async fn on_connected(&self) {
        if let Some(ip) = detect_local_ip() {
            info!(%ip, "reporting local ip");
            if let Err(err) = self.client.report_ip(ip).await {
                warn!(%err, "failed to report ip");
            }
        } else {
            warn!("could not detect a local ip");
        }

        let status = self.instance.status_label().await;
        if let Err(err) = self.client.report_xray_status(status).await {
            warn!(%err, "failed to report xray status");
        }

        if let Err(err) = self.client.request_sync(self.version.current()).await {
            warn!(%err, "failed to request sync");
        }
    }

    async fn on_frame(&self, frame: Frame) {
        match frame.frame_type {
            MessageType::Auth => self.handle_auth(frame).await,
            MessageType::ConfigDiff => self.handle_config_diff(frame).await,
            MessageType::Ack => self.handle_ack(frame),
            MessageType::Error => {
                let error = frame
                    .payload::<ErrorPayload>()
                    .map(|p| p.error)
                    .unwrap_or_default();
                warn!(error = %error, "master reported an error");
            }
            MessageType::Pong => debug!("pong"),
            other => warn!(frame_type = %other, "unexpected frame type from master"),
        }
    }
}

/// Best-effort first non-loopback IPv4 of this host, found by the routing
/// table (no packet is sent).
pub fn detect_local_ip() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_loopback() => Some(ip.to_string()),
        _ => None,
    }
}
