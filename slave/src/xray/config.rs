//! Typed model of the xray configuration file, plus the bootstrap injection
//! that guarantees the administrative channel the counter queries need.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::XrayResult;

/// Tag of the injected administrative ingress and its routing rule.
pub const API_TAG: &str = "api";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct XrayConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<LogConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<ApiConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<StatsConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicyConfig>,
    #[serde(default)]
    pub inbounds: Vec<Inbound>,
    #[serde(default)]
    pub outbounds: Vec<Outbound>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<RoutingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub loglevel: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub tag: String,
    pub services: Vec<String>,
}

/// Presence of this (empty) block enables the engine's stats subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsConfig {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub levels: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPolicy>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemPolicy {
    pub stats_inbound_uplink: bool,
    pub stats_inbound_downlink: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inbound {
    pub tag: String,
    pub port: u16,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
    #[serde(
        rename = "streamSettings",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub stream_settings: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outbound {
    pub tag: String,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
    #[serde(
        rename = "streamSettings",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub stream_settings: Option<Value>,
    #[serde(
        rename = "proxySettings",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub proxy_settings: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mux: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(
        rename = "domainStrategy",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub domain_strategy: Option<String>,
    #[serde(
        rename = "domainMatcher",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub domain_matcher: Option<String>,
    #[serde(default)]
    pub rules: Vec<RoutingRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub balancers: Vec<Balancer>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingRule {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub rule_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Vec<String>>,
    #[serde(
        rename = "inboundTag",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub inbound_tag: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attrs: Option<String>,
    #[serde(
        rename = "outboundTag",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub outbound_tag: Option<String>,
    #[serde(
        rename = "balancerTag",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub balancer_tag: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balancer {
    pub tag: String,
    pub selector: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
}

/// A minimal working configuration for nodes started without one: a local
/// socks ingress and a direct egress.
pub fn default_config() -> Vec<u8> {
    let config = XrayConfig {
        log: Some(LogConfig {
            loglevel: "info".to_string(),
        }),
        inbounds: vec![Inbound {
            tag: "socks-in".to_string(),
            port: 10808,
            protocol: "socks".to_string(),
            listen: None,
            settings: Some(serde_json::json!({"auth": "noauth", "udp": true})),
            stream_settings: None,
        }],
        outbounds: vec![Outbound {
            tag: "direct".to_string(),
            protocol: "freedom".to_string(),
            settings: Some(serde_json::json!({})),
            stream_settings: None,
            proxy_settings: None,
            mux: None,
        }],
        ..Default::default()
    };
    serde_json::to_vec_pretty(&config).unwrap_or_default()
}

pub fn load_from_file(path: &std::path::Path) -> XrayResult<Vec<u8>> {
    Ok(std::fs::read(path)?)
}

/// Check that the bytes parse as a configuration at all.
pub fn validate(raw: &[u8]) -> XrayResult<()> {
    serde_json::from_slice::<XrayConfig>(raw)?;
    Ok(())
}

/// Make sure the configuration carries the administrative channel the
/// counter queries depend on. Idempotent: absent pieces are added, present
/// ones are normalized.
///
/// Injected pieces:
/// - the stats block and a policy enabling per-ingress counters
/// - an API block exposing the stats and handler services
/// - a pass-through ingress `api` on `127.0.0.1:<api_port>`
/// - a routing rule `api` → `api`, prepended so nothing shadows it
pub fn ensure_admin_channel(config: &mut XrayConfig, api_port: u16) {
    if config.stats.is_none() {
        config.stats = Some(StatsConfig {});
    }

    if config.api.is_none() {
        config.api = Some(ApiConfig {
            tag: API_TAG.to_string(),
            services: vec!["StatsService".to_string(), "HandlerService".to_string()],
        });
    }

    let policy = config.policy.get_or_insert_with(PolicyConfig::default);
    match policy.system.as_mut() {
        Some(system) => {
            system.stats_inbound_uplink = true;
            system.stats_inbound_downlink = true;
        }
        None => {
            policy.system = Some(SystemPolicy {
                stats_inbound_uplink: true,
                stats_inbound_downlink: true,
            });
        }
    }

    if !config.inbounds.iter().any(|i| i.tag == API_TAG) {
        config.inbounds.push(Inbound {
            tag: API_TAG.to_string(),
            port: api_port,
            protocol: "dokodemo-door".to_string(),
            listen: Some("127.0.0.1".to_string()),
            settings: Some(serde_json::json!({"address": "127.0.0.1"})),
            stream_settings: None,
        });
    }

    let routing = config.routing.get_or_insert_with(RoutingConfig::default);
    let has_api_rule = routing
        .rules
        .iter()
        .any(|r| r.outbound_tag.as_deref() == Some(API_TAG));
    if !has_api_rule {
        routing.rules.insert(
            0,
            RoutingRule {
                rule_type: Some("field".to_string()),
                inbound_tag: Some(vec![API_TAG.to_string()]),
                outbound_tag: Some(API_TAG.to_string()),
                ..Default::default()
            },
        );
    }
}
