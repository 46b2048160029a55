//! Projector fold tests: the scenarios a node replays after connecting and
//! the replay-safety properties the protocol depends on.

use std::sync::Arc;

use serde_json::{json, Value};
use xfleet_protocol::ConfigAction;
use xfleet_slave::xray::config::XrayConfig;
use xfleet_slave::xray::projector::{apply_action, ProjectError};
use xfleet_slave::xray::{ConfigManager, XrayInstance};

fn fold(config: &mut XrayConfig, diffs: &[(ConfigAction, Value)]) {
    for (action, content) in diffs {
        apply_action(config, *action, content).unwrap();
    }
}

fn fresh_sync_diffs() -> Vec<(ConfigAction, Value)> {
    vec![
        (
            ConfigAction::Add,
            json!({"tag": "in1", "port": 10808, "protocol": "socks"}),
        ),
        (
            ConfigAction::Add,
            json!({"tag": "out1", "protocol": "freedom"}),
        ),
    ]
}

/// Fresh sync: two ADDs produce one inbound and one outbound.
#[test]
fn test_fresh_sync_fold() {
    let mut config = XrayConfig::default();
    fold(&mut config, &fresh_sync_diffs());

    assert_eq!(config.inbounds.len(), 1);
    assert_eq!(config.inbounds[0].tag, "in1");
    assert_eq!(config.inbounds[0].port, 10808);
    assert_eq!(config.outbounds.len(), 1);
    assert_eq!(config.outbounds[0].tag, "out1");
}

/// Mixed kinds: balancer, routing rule, and a delete, replayed on top of
/// the fresh-sync state.
#[test]
fn test_mixed_kinds_fold() {
    let mut config = XrayConfig::default();
    fold(&mut config, &fresh_sync_diffs());
    fold(
        &mut config,
        &[
            (
                ConfigAction::Add,
                json!({"tag": "b1", "selector": ["out"], "strategy": "random"}),
            ),
            (ConfigAction::Add, json!({"outboundTag": "out1"})),
            // a delete may arrive as a bare tag
            (ConfigAction::Delete, json!({"tag": "in1"})),
        ],
    );

    assert!(config.inbounds.is_empty());
    assert_eq!(config.outbounds.len(), 1);
    let routing = config.routing.as_ref().unwrap();
    assert_eq!(routing.balancers.len(), 1);
    assert_eq!(routing.balancers[0].tag, "b1");
    assert_eq!(routing.rules.len(), 1);
    assert_eq!(routing.rules[0].outbound_tag.as_deref(), Some("out1"));
}

/// Replaying a prefix of already-applied ADDs is a no-op: the state after
/// applying 1..N equals the state after 1..k then k+1..N, and re-applying
/// any applied ADD reports "not modified" so no reload fires.
#[test]
fn test_add_replay_is_noop() {
    let diffs = fresh_sync_diffs();

    let mut replayed = XrayConfig::default();
    fold(&mut replayed, &diffs);
    // the coordinator lost our ack and re-streams everything
    for (action, content) in &diffs {
        let modified = apply_action(&mut replayed, *action, content).unwrap();
        assert!(!modified, "replayed add must not modify");
    }

    let mut once = XrayConfig::default();
    fold(&mut once, &diffs);
    assert_eq!(
        serde_json::to_value(&replayed).unwrap(),
        serde_json::to_value(&once).unwrap()
    );
}

#[test]
fn test_update_replaces_in_place() {
    let mut config = XrayConfig::default();
    fold(&mut config, &fresh_sync_diffs());

    let modified = apply_action(
        &mut config,
        ConfigAction::Update,
        &json!({"tag": "in1", "port": 20000, "protocol": "socks"}),
    )
    .unwrap();
    assert!(modified);
    assert_eq!(config.inbounds.len(), 1);
    assert_eq!(config.inbounds[0].port, 20000);
}

/// UPDATE and DELETE of a missing tag are errors, not silent no-ops.
#[test]
fn test_update_delete_missing_tag_fail() {
    let mut config = XrayConfig::default();

    let err = apply_action(
        &mut config,
        ConfigAction::Update,
        &json!({"tag": "ghost", "port": 1, "protocol": "socks"}),
    )
    .unwrap_err();
    assert!(matches!(err, ProjectError::NotFound { .. }));

    let err = apply_action(
        &mut config,
        ConfigAction::Delete,
        &json!({"tag": "ghost", "protocol": "freedom"}),
    )
    .unwrap_err();
    assert!(matches!(err, ProjectError::NotFound { .. }));

    // a bare-tag delete of an unknown tag fails after searching every section
    let err = apply_action(&mut config, ConfigAction::Delete, &json!({"tag": "ghost"}))
        .unwrap_err();
    assert!(matches!(err, ProjectError::TagNotFound(_)));

    // a failed action leaves the configuration untouched
    assert_eq!(
        serde_json::to_value(&config).unwrap(),
        serde_json::to_value(XrayConfig::default()).unwrap()
    );
}

/// A bare-tag delete finds its entry whichever section holds the tag.
#[test]
fn test_bare_tag_delete_locates_section() {
    let mut config = XrayConfig::default();
    fold(&mut config, &fresh_sync_diffs());
    fold(
        &mut config,
        &[(
            ConfigAction::Add,
            json!({"tag": "b1", "selector": ["out"], "strategy": "random"}),
        )],
    );

    assert!(apply_action(&mut config, ConfigAction::Delete, &json!({"tag": "out1"})).unwrap());
    assert!(config.outbounds.is_empty());

    assert!(apply_action(&mut config, ConfigAction::Delete, &json!({"tag": "b1"})).unwrap());
    assert!(config.routing.as_ref().unwrap().balancers.is_empty());
}

#[test]
fn test_routing_rule_keyed_by_outbound_tag() {
    let mut config = XrayConfig::default();
    fold(
        &mut config,
        &[(
            ConfigAction::Add,
            json!({"outboundTag": "out1", "inboundTag": ["in1"]}),
        )],
    );

    let modified = apply_action(
        &mut config,
        ConfigAction::Update,
        &json!({"outboundTag": "out1", "inboundTag": ["in1", "in2"]}),
    )
    .unwrap();
    assert!(modified);
    let rules = &config.routing.as_ref().unwrap().rules;
    assert_eq!(rules.len(), 1);
    assert_eq!(
        rules[0].inbound_tag.as_ref().unwrap(),
        &["in1".to_string(), "in2".to_string()]
    );

    apply_action(
        &mut config,
        ConfigAction::Delete,
        &json!({"outboundTag": "out1"}),
    )
    .unwrap();
    assert!(config.routing.as_ref().unwrap().rules.is_empty());

    let err = apply_action(
        &mut config,
        ConfigAction::Delete,
        &json!({"outboundTag": "out1"}),
    )
    .unwrap_err();
    assert!(matches!(err, ProjectError::NotFound { .. }));
}

/// A replayed routing-rule ADD is a no-op, like every other kind.
#[test]
fn test_routing_duplicate_add_is_noop() {
    let mut config = XrayConfig::default();
    let rule = json!({"outboundTag": "out1", "inboundTag": ["in1"]});

    assert!(apply_action(&mut config, ConfigAction::Add, &rule).unwrap());
    assert!(!apply_action(&mut config, ConfigAction::Add, &rule).unwrap());
    assert_eq!(config.routing.as_ref().unwrap().rules.len(), 1);
}

#[test]
fn test_balancer_duplicate_add_is_noop() {
    let mut config = XrayConfig::default();
    let balancer = json!({"tag": "b1", "selector": ["out"], "strategy": "random"});

    assert!(apply_action(&mut config, ConfigAction::Add, &balancer).unwrap());
    assert!(!apply_action(&mut config, ConfigAction::Add, &balancer).unwrap());
    assert_eq!(config.routing.as_ref().unwrap().balancers.len(), 1);
}

#[test]
fn test_unclassifiable_content_fails() {
    let mut config = XrayConfig::default();
    let err = apply_action(&mut config, ConfigAction::Add, &json!({"tag": "x"})).unwrap_err();
    assert!(matches!(err, ProjectError::UnknownKind));
}

#[test]
fn test_missing_tag_fails() {
    let mut config = XrayConfig::default();
    let err = apply_action(
        &mut config,
        ConfigAction::Add,
        &json!({"port": 1, "protocol": "socks"}),
    )
    .unwrap_err();
    assert!(matches!(err, ProjectError::MissingTag));
}

/// A failed reload leaves the in-memory configuration untouched, so a
/// replay of the same diff retries the reload instead of hitting the
/// duplicate-add no-op and acking a proxy that never restarted.
#[tokio::test]
async fn test_failed_reload_keeps_config_and_replay_retries() {
    // an engine binary that cannot exist makes every start() fail
    let instance = Arc::new(XrayInstance::new("/nonexistent/xray-binary", 10085));
    let manager = ConfigManager::new(instance);
    let initial = serde_json::to_vec(&XrayConfig::default()).unwrap();
    manager.load_initial(&initial).await.unwrap();

    let diff = json!({"tag": "in1", "port": 10808, "protocol": "socks"});
    let err = manager
        .apply_diff(ConfigAction::Add, &diff)
        .await
        .unwrap_err();
    assert!(matches!(err, ProjectError::Xray(_)));

    // the mutation did not land
    let snapshot = manager.snapshot().await.unwrap();
    assert!(snapshot.inbounds.is_empty());

    // the replayed diff fails on the reload again, not as a duplicate add
    let err = manager
        .apply_diff(ConfigAction::Add, &diff)
        .await
        .unwrap_err();
    assert!(matches!(err, ProjectError::Xray(_)));
}

#[test]
fn test_bad_payload_reports_kind() {
    let mut config = XrayConfig::default();
    // classified as inbound, but the port is not a number
    let err = apply_action(
        &mut config,
        ConfigAction::Add,
        &json!({"tag": "in1", "port": "not-a-port", "protocol": "socks"}),
    )
    .unwrap_err();
    assert!(matches!(err, ProjectError::BadPayload { .. }));
}
