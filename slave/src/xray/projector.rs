//! Folds the diff stream onto the in-memory configuration.
//!
//! Replays are a normal part of the protocol (at-least-once delivery after
//! a lost ack), so ADD of an existing tag is a logged no-op that triggers
//! no reload. UPDATE and DELETE of a missing tag are errors; masking them
//! would hide genuine divergence between master and slave.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use xfleet_protocol::{ConfigAction, ConfigKind};

use super::config::{RoutingConfig, RoutingRule, XrayConfig};
use super::instance::XrayInstance;
use super::{XrayError, XrayResult};

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("configuration not initialized")]
    NotInitialized,

    #[error("diff content cannot be classified")]
    UnknownKind,

    #[error("diff content carries no tag")]
    MissingTag,

    #[error("tag '{0}' not found in any configuration section")]
    TagNotFound(String),

    #[error("{kind} '{tag}' does not exist")]
    NotFound { kind: ConfigKind, tag: String },

    #[error("invalid {kind} payload: {source}")]
    BadPayload {
        kind: ConfigKind,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Xray(#[from] XrayError),
}

/// Owns the in-memory configuration and drives hot-reload.
pub struct ConfigManager {
    instance: Arc<XrayInstance>,
    /// Whole apply-then-reload critical section runs under this lock so two
    /// diffs can never interleave partial mutations.
    current: Mutex<Option<XrayConfig>>,
}

impl ConfigManager {
    pub fn new(instance: Arc<XrayInstance>) -> Self {
        Self {
            instance,
            current: Mutex::new(None),
        }
    }

    pub async fn load_initial(&self, raw: &[u8]) -> XrayResult<()> {
        let config: XrayConfig = serde_json::from_slice(raw)?;
        info!(
            inbounds = config.inbounds.len(),
            outbounds = config.outbounds.len(),
            "initial configuration loaded"
        );
        *self.current.lock().await = Some(config);
        Ok(())
    }

    /// Apply one diff. Returns whether the configuration changed (and the
    /// proxy was therefore reloaded).
    ///
    /// The mutation lands on a working copy that replaces the live
    /// configuration only once the engine is running on it. A failed
    /// reload keeps the previous state, so a replay of the same diff
    /// retries the reload instead of seeing its own half-applied change.
    pub async fn apply_diff(
        &self,
        action: ConfigAction,
        content: &Value,
    ) -> Result<bool, ProjectError> {
        let mut guard = self.current.lock().await;
        let current = guard.as_ref().ok_or(ProjectError::NotInitialized)?;

        let mut candidate = current.clone();
        let modified = apply_action(&mut candidate, action, content)?;
        if modified {
            self.reload(&candidate).await?;
            *guard = Some(candidate);
        }
        Ok(modified)
    }

    /// Serialize the current configuration and restart the engine on it.
    /// The bootstrap injection re-runs inside `load_config`.
    async fn reload(&self, config: &XrayConfig) -> XrayResult<()> {
        let raw = serde_json::to_vec_pretty(config)?;
        info!("configuration changed, reloading xray");
        self.instance.stop().await;
        self.instance.load_config(&raw).await?;
        self.instance.start().await
    }

    /// Ingress tags of the current configuration (the sampler's query set).
    pub async fn inbound_tags(&self) -> Vec<String> {
        match self.current.lock().await.as_ref() {
            Some(config) => config.inbounds.iter().map(|i| i.tag.clone()).collect(),
            None => Vec::new(),
        }
    }

    /// Copy of the in-memory configuration.
    pub async fn snapshot(&self) -> Option<XrayConfig> {
        self.current.lock().await.clone()
    }
}

/// The pure fold: mutate `config` according to one diff and report whether
/// anything changed.
pub fn apply_action(
    config: &mut XrayConfig,
    action: ConfigAction,
    content: &Value,
) -> Result<bool, ProjectError> {
    let kind = match ConfigKind::classify(content) {
        Some(kind) => kind,
        // A delete may arrive as a bare `{tag}` with nothing for the
        // heuristic to bite on; the tag only needs to be found, so look
        // it up in the current sections instead.
        None if action == ConfigAction::Delete => locate_tag(config, content)?,
        None => return Err(ProjectError::UnknownKind),
    };
    let tag = kind
        .tag_of(content)
        .ok_or(ProjectError::MissingTag)?
        .to_string();
    info!(%kind, %action, %tag, "applying configuration diff");

    match kind {
        ConfigKind::Inbound => {
            apply_tagged(action, &mut config.inbounds, kind, &tag, content, |i| &i.tag)
        }
        ConfigKind::Outbound => {
            apply_tagged(action, &mut config.outbounds, kind, &tag, content, |o| &o.tag)
        }
        ConfigKind::Balancer => {
            let routing = config.routing.get_or_insert_with(RoutingConfig::default);
            apply_tagged(action, &mut routing.balancers, kind, &tag, content, |b| &b.tag)
        }
        ConfigKind::Routing => apply_routing_rule(config, action, &tag, content),
    }
}

/// ADD / UPDATE / DELETE against a list of entries keyed by tag.
fn apply_tagged<T: DeserializeOwned>(
    action: ConfigAction,
    entries: &mut Vec<T>,
    kind: ConfigKind,
    tag: &str,
    content: &Value,
    tag_of: impl Fn(&T) -> &str,
) -> Result<bool, ProjectError> {
    let position = entries.iter().position(|e| tag_of(e) == tag);
    match action {
        ConfigAction::Add => {
            if position.is_some() {
                warn!(%kind, tag, "entry already exists, skipping add");
                return Ok(false);
            }
            entries.push(decode(kind, content)?);
            Ok(true)
        }
        ConfigAction::Update => match position {
            Some(index) => {
                entries[index] = decode(kind, content)?;
                Ok(true)
            }
            None => Err(ProjectError::NotFound {
                kind,
                tag: tag.to_string(),
            }),
        },
        ConfigAction::Delete => match position {
            Some(index) => {
                entries.remove(index);
                Ok(true)
            }
            None => Err(ProjectError::NotFound {
                kind,
                tag: tag.to_string(),
            }),
        },
    }
}

/// Routing rules have no tag of their own; their `outboundTag` keys them,
/// for the ADD duplicate check as much as for UPDATE/DELETE.
fn apply_routing_rule(
    config: &mut XrayConfig,
    action: ConfigAction,
    tag: &str,
    content: &Value,
) -> Result<bool, ProjectError> {
    match action {
        ConfigAction::Add => {
            let routing = config.routing.get_or_insert_with(RoutingConfig::default);
            if routing
                .rules
                .iter()
                .any(|r| r.outbound_tag.as_deref() == Some(tag))
            {
                warn!(kind = %ConfigKind::Routing, tag, "entry already exists, skipping add");
                return Ok(false);
            }
            let rule: RoutingRule = decode(ConfigKind::Routing, content)?;
            routing.rules.push(rule);
            Ok(true)
        }
        ConfigAction::Update | ConfigAction::Delete => {
            let routing = config.routing.as_mut().ok_or(ProjectError::NotFound {
                kind: ConfigKind::Routing,
                tag: tag.to_string(),
            })?;
            let position = routing
                .rules
                .iter()
                .position(|r| r.outbound_tag.as_deref() == Some(tag));
            match (action, position) {
                (ConfigAction::Update, Some(index)) => {
                    routing.rules[index] = decode(ConfigKind::Routing, content)?;
                    Ok(true)
                }
                (ConfigAction::Delete, Some(index)) => {
                    routing.rules.remove(index);
                    Ok(true)
                }
                _ => Err(ProjectError::NotFound {
                    kind: ConfigKind::Routing,
                    tag: tag.to_string(),
                }),
            }
        }
    }
}

/// Which section currently holds this tag. Routing rules never match here:
/// they are keyed by `outboundTag`, which the heuristic already classifies.
fn locate_tag(config: &XrayConfig, content: &Value) -> Result<ConfigKind, ProjectError> {
    let tag = content
        .get("tag")
        .and_then(Value::as_str)
        .ok_or(ProjectError::MissingTag)?;
    if config.inbounds.iter().any(|i| i.tag == tag) {
        Ok(ConfigKind::Inbound)
    } else if config.outbounds.iter().any(|o| o.tag == tag) {
        Ok(ConfigKind::Outbound)
    } else if config
        .routing
        .as_ref()
        .is_some_and(|r| r.balancers.iter().any(|b| b.tag == tag))
    {
        Ok(ConfigKind::Balancer)
    } else {
        Err(ProjectError::TagNotFound(tag.to_string()))
    }
}

fn decode<T: DeserializeOwned>(kind: ConfigKind, content: &Value) -> Result<T, ProjectError> {
    serde_json::from_value(content.clone())
        .map_err(|source| ProjectError::BadPayload { kind, source })
}
