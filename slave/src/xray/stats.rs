//! The traffic sampler.
//!
//! The engine's counters are cumulative per process and reset to zero on
//! every restart, which happens on every applied diff. The sampler turns
//! them into a well-behaved stream of non-negative deltas: a 10 s collect
//! tick snapshots every ingress counter and accumulates the delta since the
//! previous snapshot, a 60 s report tick flushes the aggregate (if any)
//! as one report.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use xfleet_protocol::TrafficSample;

use super::instance::XrayInstance;
use super::projector::ConfigManager;

pub const COLLECT_INTERVAL: Duration = Duration::from_secs(10);
pub const REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Last observed cumulative counters for one ingress.
#[derive(Debug, Clone, Copy, Default)]
struct Cumulative {
    uplink: i64,
    downlink: i64,
}

pub struct TrafficSampler {
    instance: Arc<XrayInstance>,
    manager: Arc<ConfigManager>,
    last: HashMap<String, Cumulative>,
    aggregated: HashMap<String, TrafficSample>,
}

impl TrafficSampler {
    pub fn new(instance: Arc<XrayInstance>, manager: Arc<ConfigManager>) -> Self {
        Self {
            instance,
            manager,
            last: HashMap::new(),
            aggregated: HashMap::new(),
        }
    }

    /// Run both timers until shutdown. Each non-empty reporting window
    /// emits exactly one aggregate on `reports`.
    pub async fn run(
        mut self,
        reports: mpsc::Sender<HashMap<String, TrafficSample>>,
        shutdown: CancellationToken,
    ) {
        let mut collect = tokio::time::interval(COLLECT_INTERVAL);
        let mut report = tokio::time::interval(REPORT_INTERVAL);
        // consume the immediate first tick of both timers
        collect.tick().await;
        report.tick().await;
        info!(
            collect_secs = COLLECT_INTERVAL.as_secs(),
            report_secs = REPORT_INTERVAL.as_secs(),
            "traffic sampler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("traffic sampler stopped");
                    return;
                }
                _ = collect.tick() => self.collect().await,
                _ = report.tick() => {
                    if self.aggregated.is_empty() {
                        continue;
                    }
                    let window = std::mem::take(&mut self.aggregated);
                    debug!(ingresses = window.len(), "flushing traffic window");
                    if let Err(err) = reports.send(window).await {
                        warn!(%err, "traffic report channel closed");
                        return;
                    }
                }
            }
        }
    }

    async fn collect(&mut self) {
        if !self.instance.is_running().await {
            return;
        }
        for tag in self.manager.inbound_tags().await {
            let now = Cumulative {
                uplink: self.query_stat(&tag, "uplink").await,
                downlink: self.query_stat(&tag, "downlink").await,
            };
            let previous = self.last.get(&tag).copied();
            let delta_up = delta(previous.map(|p| p.uplink), now.uplink);
            let delta_down = delta(previous.map(|p| p.downlink), now.downlink);
            self.last.insert(tag.clone(), now);

            if delta_up > 0 || delta_down > 0 {
                debug!(tag = %tag, delta_up, delta_down, "traffic sampled");
                let entry = self.aggregated.entry(tag).or_default();
                entry.uplink += delta_up;
                entry.downlink += delta_down;
            }
        }
    }

    /// Query one cumulative counter through the engine's stats CLI. Any
    /// failure (process, exit status, parse) counts as zero for this
    /// sample.
    async fn query_stat(&self, tag: &str, direction: &str) -> i64 {
        let pattern = format!("inbound>>>{tag}>>>traffic>>>{direction}");
        let output = Command::new(self.instance.xray_path())
            .arg("api")
            .arg("statsquery")
            .arg(format!("--server=127.0.0.1:{}", self.instance.api_port()))
            .arg(format!("-pattern={pattern}"))
            .arg("-reset=false")
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => {
                parse_stat_value(&String::from_utf8_lossy(&out.stdout))
            }
            Ok(out) => {
                debug!(tag, direction, status = %out.status, "statsquery failed");
                0
            }
            Err(err) => {
                debug!(tag, direction, %err, "statsquery could not run");
                0
            }
        }
    }
}

/// Delta against the previous cumulative sample.
///
/// A counter that went backwards means the engine restarted and reset; the
/// post-restart value is taken as the whole delta. The first sample for a
/// tag is treated the same way.
fn delta(previous: Option<i64>, now: i64) -> i64 {
    match previous {
        Some(prev) if now >= prev => now - prev,
        _ => now.max(0),
    }
}

/// Extract the `value:` line from statsquery stdout.
fn parse_stat_value(stdout: &str) -> i64 {
    for line in stdout.lines() {
        if let Some(rest) = line.trim().strip_prefix("value:") {
            if let Ok(value) = rest.trim().trim_matches('"').parse() {
                return value;
            }
        }
    }
    0
}
