//! Lifecycle of the external xray process.
//!
//! The engine runs as a child process pointed at a disposable temp file
//! holding the current configuration. Every reload is a full stop/start;
//! the engine has no cheaper reload path, and that cost is accepted.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::config::{self, XrayConfig};
use super::{XrayError, XrayResult};

/// Grace period after start before the engine is assumed to serve.
const SETTLE_DELAY: Duration = Duration::from_millis(500);

#[derive(Default)]
struct InstanceState {
    /// Serialized configuration, post bootstrap injection.
    config: Option<Vec<u8>>,
    child: Option<Child>,
    config_path: Option<PathBuf>,
}

/// Handle to the (at most one) xray process this agent manages.
pub struct XrayInstance {
    xray_path: PathBuf,
    api_port: u16,
    state: Mutex<InstanceState>,
}

impl XrayInstance {
    pub fn new(xray_path: impl Into<PathBuf>, api_port: u16) -> Self {
        Self {
            xray_path: xray_path.into(),
            api_port,
            state: Mutex::new(InstanceState::default()),
        }
    }

    pub fn xray_path(&self) -> &Path {
        &self.xray_path
    }

    pub fn api_port(&self) -> u16 {
        self.api_port
    }

    /// Parse, inject the administrative channel, and stage the
    /// configuration for the next [`XrayInstance::start`].
    pub async fn load_config(&self, raw: &[u8]) -> XrayResult<()> {
        let mut config: XrayConfig = serde_json::from_slice(raw)?;
        config::ensure_admin_channel(&mut config, self.api_port);
        let staged = serde_json::to_vec_pretty(&config)?;

        let mut state = self.state.lock().await;
        state.config = Some(staged);
        info!(
            inbounds = config.inbounds.len(),
            outbounds = config.outbounds.len(),
            "configuration staged"
        );
        Ok(())
    }

    /// Start the engine on the staged configuration, stopping a running
    /// instance first.
    pub async fn start(&self) -> XrayResult<()> {
        let mut state = self.state.lock().await;
        let Some(config) = state.config.clone() else {
            return Err(XrayError::NotLoaded);
        };
        stop_locked(&mut state).await;

        let config_path = temp_config_path();
        tokio::fs::write(&config_path, &config).await?;

        let spawned = Command::new(&self.xray_path)
            .arg("run")
            .arg("-c")
            .arg(&config_path)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn();
        let child = match spawned {
            Ok(child) => child,
            Err(err) => {
                let _ = tokio::fs::remove_file(&config_path).await;
                return Err(err.into());
            }
        };

        info!(pid = child.id(), config = %config_path.display(), "xray started");
        state.child = Some(child);
        state.config_path = Some(config_path);
        drop(state);

        tokio::time::sleep(SETTLE_DELAY).await;
        Ok(())
    }

    /// Kill the engine and clean up its temp config file. Idempotent.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        stop_locked(&mut state).await;
    }

    pub async fn is_running(&self) -> bool {
        let mut state = self.state.lock().await;
        match state.child.as_mut() {
            // try_wait returns Ok(None) while the child is still alive
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Status string reported to the master.
    pub async fn status_label(&self) -> &'static str {
        if self.is_running().await {
            "running"
        } else {
            "stopped"
        }
    }
}

async fn stop_locked(state: &mut InstanceState) {
    if let Some(mut child) = state.child.take() {
        if let Err(err) = child.kill().await {
            warn!(%err, "failed to kill xray process");
        }
        let _ = child.wait().await;
        info!("xray stopped");
    }
    if let Some(path) = state.config_path.take() {
        let _ = tokio::fs::remove_file(path).await;
    }
}

fn temp_config_path() -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    std::env::temp_dir().join(format!("xray-config-{nanos}.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_without_config_fails() {
        let instance = XrayInstance::new("xray", 10085);
        assert!(matches!(instance.start().await, Err(XrayError::NotLoaded)));
        assert!(!instance.is_running().await);
    }

    #[tokio::test]
    async fn test_load_config_rejects_garbage() {
        let instance = XrayInstance::new("xray", 10085);
        assert!(instance.load_config(b"not json").await.is_err());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_when_never_started() {
        let instance = XrayInstance::new("xray", 10085);
        instance.stop().await;
        instance.stop().await;
        assert_eq!(instance.status_label().await, "stopped");
    }
}
