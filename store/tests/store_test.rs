//! Integration tests for the coordinator store: registry lifecycle, diff-log
//! invariants, and counter accumulation.

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;
use xfleet_protocol::{ConfigAction, ConfigKind};
use xfleet_store::{NodeStatus, Store, StoreError};

fn open_store() -> (TempDir, Store) {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path().join("test.redb")).unwrap();
    (dir, store)
}

#[test]
fn test_node_lifecycle() {
    let (_dir, store) = open_store();

    let node = store.create_node("node-a").unwrap();
    assert_eq!(node.id, 1);
    assert_eq!(node.status, NodeStatus::Offline);
    assert_eq!(node.xray_status, "unknown");
    assert_eq!(node.current_version, 0);

    let fetched = store.get_node(node.id).unwrap();
    assert_eq!(fetched.name, "node-a");

    let by_name = store.find_node_by_name("node-a").unwrap().unwrap();
    assert_eq!(by_name.id, node.id);
    assert!(store.find_node_by_name("ghost").unwrap().is_none());

    store.update_node_status(node.id, NodeStatus::Online).unwrap();
    store.update_node_ip(node.id, "203.0.113.9").unwrap();
    store.update_node_xray_status(node.id, "running").unwrap();
    store.update_node_version(node.id, 5).unwrap();

    let fetched = store.get_node(node.id).unwrap();
    assert_eq!(fetched.status, NodeStatus::Online);
    assert_eq!(fetched.ip.as_deref(), Some("203.0.113.9"));
    assert_eq!(fetched.xray_status, "running");
    assert_eq!(fetched.current_version, 5);
    assert!(fetched.last_seen.is_some());
}

#[test]
fn test_node_names_are_unique() {
    let (_dir, store) = open_store();
    store.create_node("node-a").unwrap();
    assert!(matches!(
        store.create_node("node-a"),
        Err(StoreError::NameTaken(_))
    ));
}

#[test]
fn test_missing_node_errors() {
    let (_dir, store) = open_store();
    assert!(matches!(store.get_node(99), Err(StoreError::NodeNotFound(99))));
    assert!(matches!(
        store.update_node_status(99, NodeStatus::Online),
        Err(StoreError::NodeNotFound(99))
    ));
    assert!(matches!(
        store.append_diff(99, 1, ConfigKind::Inbound, ConfigAction::Add, json!({})),
        Err(StoreError::NodeNotFound(99))
    ));
}

#[test]
fn test_append_and_list_ascending() {
    let (_dir, store) = open_store();
    let node = store.create_node("node-a").unwrap();

    // append out of order on purpose; the scan must come back ascending
    for version in [2i64, 1, 3] {
        store
            .append_diff(
                node.id,
                version,
                ConfigKind::Inbound,
                ConfigAction::Add,
                json!({"tag": format!("in{version}"), "port": 10000 + version}),
            )
            .unwrap();
    }

    assert_eq!(store.latest_version(node.id).unwrap(), 3);

    let all = store.list_diffs_after(node.id, 0).unwrap();
    assert_eq!(
        all.iter().map(|d| d.version).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    let tail = store.list_diffs_after(node.id, 2).unwrap();
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].version, 3);

    assert!(store.list_diffs_after(node.id, 3).unwrap().is_empty());
}

#[test]
fn test_version_collision_rejected() {
    let (_dir, store) = open_store();
    let node = store.create_node("node-a").unwrap();

    let next = store.latest_version(node.id).unwrap() + 1;
    store
        .append_diff(node.id, next, ConfigKind::Outbound, ConfigAction::Add, json!({"tag": "o"}))
        .unwrap();
    // a racing writer computed the same next version; exactly one wins
    let err = store
        .append_diff(node.id, next, ConfigKind::Outbound, ConfigAction::Add, json!({"tag": "p"}))
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::VersionConflict { version: 1, .. }
    ));
}

#[test]
fn test_versions_are_per_node() {
    let (_dir, store) = open_store();
    let a = store.create_node("node-a").unwrap();
    let b = store.create_node("node-b").unwrap();

    store
        .append_diff(a.id, 1, ConfigKind::Inbound, ConfigAction::Add, json!({"tag": "x"}))
        .unwrap();
    assert_eq!(store.latest_version(a.id).unwrap(), 1);
    assert_eq!(store.latest_version(b.id).unwrap(), 0);
    assert!(store.list_diffs_after(b.id, 0).unwrap().is_empty());
}

#[test]
fn test_list_by_kind_and_get_by_id() {
    let (_dir, store) = open_store();
    let node = store.create_node("node-a").unwrap();

    let d1 = store
        .append_diff(node.id, 1, ConfigKind::Inbound, ConfigAction::Add, json!({"tag": "in1"}))
        .unwrap();
    store
        .append_diff(node.id, 2, ConfigKind::Outbound, ConfigAction::Add, json!({"tag": "out1"}))
        .unwrap();
    store
        .append_diff(node.id, 3, ConfigKind::Inbound, ConfigAction::Delete, json!({"tag": "in1"}))
        .unwrap();

    let inbounds = store
        .list_diffs_by_kind_after(node.id, ConfigKind::Inbound, 0)
        .unwrap();
    assert_eq!(
        inbounds.iter().map(|d| d.version).collect::<Vec<_>>(),
        vec![1, 3]
    );

    let fetched = store.get_diff(d1.id).unwrap();
    assert_eq!(fetched.version, 1);
    assert_eq!(fetched.kind, ConfigKind::Inbound);
    assert!(matches!(store.get_diff(999), Err(StoreError::DiffNotFound(999))));
}

#[test]
fn test_traffic_accumulates() {
    let (_dir, store) = open_store();
    let node = store.create_node("node-a").unwrap();

    store.add_traffic(node.id, "in1", 100, 200).unwrap();
    store.add_traffic(node.id, "in1", 50, 0).unwrap();
    store.add_traffic(node.id, "in2", 7, 7).unwrap();

    let rows = store.traffic_for_node(node.id).unwrap();
    assert_eq!(rows.len(), 2);
    let in1 = rows.iter().find(|r| r.inbound_tag == "in1").unwrap();
    assert_eq!((in1.total_uplink, in1.total_downlink), (150, 200));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_traffic_concurrent_sum() {
    let (_dir, store) = open_store();
    let store = Arc::new(store);
    let node = store.create_node("node-a").unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        tasks.push(tokio::task::spawn_blocking(move || {
            for _ in 0..25 {
                store.add_traffic(node.id, "in1", 3, 5).unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let rows = store.traffic_for_node(node.id).unwrap();
    assert_eq!(rows[0].total_uplink, 8 * 25 * 3);
    assert_eq!(rows[0].total_downlink, 8 * 25 * 5);
}

#[test]
fn test_delete_node_cascades() {
    let (_dir, store) = open_store();
    let node = store.create_node("node-a").unwrap();
    let keep = store.create_node("node-b").unwrap();

    let diff = store
        .append_diff(node.id, 1, ConfigKind::Inbound, ConfigAction::Add, json!({"tag": "in1"}))
        .unwrap();
    store
        .append_diff(keep.id, 1, ConfigKind::Inbound, ConfigAction::Add, json!({"tag": "in1"}))
        .unwrap();
    store.add_traffic(node.id, "in1", 1, 1).unwrap();

    store.delete_node(node.id).unwrap();

    assert!(matches!(store.get_node(node.id), Err(StoreError::NodeNotFound(_))));
    assert!(store.find_node_by_name("node-a").unwrap().is_none());
    assert!(store.list_diffs_after(node.id, 0).unwrap().is_empty());
    assert!(store.traffic_for_node(node.id).unwrap().is_empty());
    assert!(matches!(store.get_diff(diff.id), Err(StoreError::DiffNotFound(_))));

    // the name is free again and the neighbour untouched
    store.create_node("node-a").unwrap();
    assert_eq!(store.list_diffs_after(keep.id, 0).unwrap().len(), 1);
}

#[test]
fn test_reset_all_offline() {
    let (_dir, store) = open_store();
    let a = store.create_node("node-a").unwrap();
    let b = store.create_node("node-b").unwrap();
    store.update_node_status(a.id, NodeStatus::Online).unwrap();
    store.update_node_xray_status(a.id, "running").unwrap();
    store.update_node_status(b.id, NodeStatus::Error).unwrap();

    store.reset_all_offline().unwrap();

    for id in [a.id, b.id] {
        let node = store.get_node(id).unwrap();
        assert_eq!(node.status, NodeStatus::Offline);
        assert_eq!(node.xray_status, "unknown");
    }
}

#[test]
fn test_reopen_preserves_state() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.redb");
    {
        let store = Store::open(&path).unwrap();
        let node = store.create_node("node-a").unwrap();
        store
            .append_diff(node.id, 1, ConfigKind::Inbound, ConfigAction::Add, json!({"tag": "in1"}))
            .unwrap();
    }
    let store = Store::open(&path).unwrap();
    let node = store.find_node_by_name("node-a").unwrap().unwrap();
    assert_eq!(store.latest_version(node.id).unwrap(), 1);
    // id allocation continues after the existing node
    assert_eq!(store.create_node("node-b").unwrap().id, 2);
}
