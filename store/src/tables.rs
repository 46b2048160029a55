//! redb table definitions.
//!
//! All tables use `&str` keys and `&[u8]` values (JSON-serialized domain
//! types) except the counters in `meta`. Numeric key components are
//! zero-padded to 20 digits so lexicographic order is numeric order.

use redb::TableDefinition;

/// Node records keyed by `{node_id:020}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Name-uniqueness index: node name → `{node_id:020}`.
pub const NODE_NAMES: TableDefinition<&str, &str> = TableDefinition::new("node_names");

/// Diff records keyed by `{node_id:020}/{version:020}`; an ascending range
/// scan under one node prefix yields the version-ordered replay stream.
pub const DIFFS: TableDefinition<&str, &[u8]> = TableDefinition::new("diffs");

/// Diff-id index: `{diff_id:020}` → diffs key.
pub const DIFF_IDS: TableDefinition<&str, &str> = TableDefinition::new("diff_ids");

/// Traffic counters keyed by `{node_id:020}/{ingress_tag}`.
pub const TRAFFIC: TableDefinition<&str, &[u8]> = TableDefinition::new("traffic");

/// Id allocators and other scalar state.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

pub fn node_key(node_id: i64) -> String {
    format!("{node_id:020}")
}

/// Prefix of every key under one node in `diffs` and `traffic`.
pub fn node_prefix(node_id: i64) -> String {
    format!("{node_id:020}/")
}

/// Exclusive upper bound of a node's prefix range ('0' sorts after '/').
pub fn node_prefix_end(node_id: i64) -> String {
    format!("{node_id:020}0")
}

pub fn diff_key(node_id: i64, version: i64) -> String {
    format!("{node_id:020}/{version:020}")
}

pub fn diff_id_key(diff_id: i64) -> String {
    format!("{diff_id:020}")
}

pub fn traffic_key(node_id: i64, tag: &str) -> String {
    format!("{node_id:020}/{tag}")
}
