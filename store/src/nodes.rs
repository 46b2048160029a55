//! Node registry: identity, liveness, applied version, proxy status.

use std::fmt;

use redb::ReadableTable;
use serde::{Deserialize, Serialize};
use xfleet_protocol::unix_timestamp;

use crate::error::{StoreError, StoreResult};
use crate::tables::{self, node_key, node_prefix, node_prefix_end};
use crate::Store;

/// Liveness status as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
    Error,
}

impl NodeStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One managed node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: i64,
    pub name: String,
    pub status: NodeStatus,
    /// Opaque proxy-process status reported by the node ("unknown" until
    /// the node says otherwise).
    pub xray_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Highest diff version the coordinator has seen acknowledged.
    pub current_version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Store {
    /// Create a node. Names are unique; ids are allocated monotonically.
    pub fn create_node(&self, name: &str) -> StoreResult<NodeRecord> {
        let txn = self.db().begin_write()?;
        let record = {
            let mut names = txn.open_table(tables::NODE_NAMES)?;
            if names.get(name)?.is_some() {
                return Err(StoreError::NameTaken(name.to_string()));
            }

            let mut meta = txn.open_table(tables::META)?;
            let id = meta.get("next_node_id")?.map(|v| v.value()).unwrap_or(1) as i64;
            meta.insert("next_node_id", id as u64 + 1)?;

            let now = unix_timestamp();
            let record = NodeRecord {
                id,
                name: name.to_string(),
                status: NodeStatus::Offline,
                xray_status: "unknown".to_string(),
                ip: None,
                current_version: 0,
                last_seen: None,
                created_at: now,
                updated_at: now,
            };

            let mut nodes = txn.open_table(tables::NODES)?;
            let encoded = serde_json::to_vec(&record)?;
            nodes.insert(node_key(id).as_str(), encoded.as_slice())?;
            names.insert(name, node_key(id).as_str())?;
            record
        };
        txn.commit()?;
        Ok(record)
    }

    pub fn get_node(&self, node_id: i64) -> StoreResult<NodeRecord> {
        let txn = self.db().begin_read()?;
        let nodes = txn.open_table(tables::NODES)?;
        match nodes.get(node_key(node_id).as_str())? {
            Some(raw) => Ok(serde_json::from_slice(raw.value())?),
            None => Err(StoreError::NodeNotFound(node_id)),
        }
    }

    pub fn find_node_by_name(&self, name: &str) -> StoreResult<Option<NodeRecord>> {
        let txn = self.db().begin_read()?;
        let names = txn.open_table(tables::NODE_NAMES)?;
        let Some(key) = names.get(name)? else {
            return Ok(None);
        };
        let nodes = txn.open_table(tables::NODES)?;
        match nodes.get(key.value())? {
            Some(raw) => Ok(Some(serde_json::from_slice(raw.value())?)),
            None => Ok(None),
        }
    }

    pub fn list_nodes(&self) -> StoreResult<Vec<NodeRecord>> {
        let txn = self.db().begin_read()?;
        let nodes = txn.open_table(tables::NODES)?;
        let mut out = Vec::new();
        for entry in nodes.range::<&str>(..)? {
            let (_, raw) = entry?;
            out.push(serde_json::from_slice(raw.value())?);
        }
        Ok(out)
    }

    /// Set liveness status; also refreshes `last_seen`.
    pub fn update_node_status(&self, node_id: i64, status: NodeStatus) -> StoreResult<()> {
        self.mutate_node(node_id, |record| {
            record.status = status;
            record.last_seen = Some(unix_timestamp());
        })
    }

    /// Record the highest version the node has acknowledged.
    pub fn update_node_version(&self, node_id: i64, version: i64) -> StoreResult<()> {
        self.mutate_node(node_id, |record| record.current_version = version)
    }

    pub fn update_node_ip(&self, node_id: i64, ip: &str) -> StoreResult<()> {
        let ip = ip.to_string();
        self.mutate_node(node_id, move |record| record.ip = Some(ip))
    }

    pub fn update_node_xray_status(&self, node_id: i64, xray_status: &str) -> StoreResult<()> {
        let xray_status = xray_status.to_string();
        self.mutate_node(node_id, move |record| record.xray_status = xray_status)
    }

    /// Delete a node and cascade its diffs and traffic counters.
    pub fn delete_node(&self, node_id: i64) -> StoreResult<()> {
        let txn = self.db().begin_write()?;
        {
            let mut nodes = txn.open_table(tables::NODES)?;
            let record: NodeRecord = match nodes.remove(node_key(node_id).as_str())? {
                Some(raw) => serde_json::from_slice(raw.value())?,
                None => return Err(StoreError::NodeNotFound(node_id)),
            };
            let mut names = txn.open_table(tables::NODE_NAMES)?;
            names.remove(record.name.as_str())?;

            let prefix = node_prefix(node_id);
            let end = node_prefix_end(node_id);

            let mut diffs = txn.open_table(tables::DIFFS)?;
            let mut diff_ids = txn.open_table(tables::DIFF_IDS)?;
            let mut dead = Vec::new();
            for entry in diffs.range::<&str>(prefix.as_str()..end.as_str())? {
                let (key, raw) = entry?;
                let diff: crate::DiffRecord = serde_json::from_slice(raw.value())?;
                dead.push((key.value().to_string(), diff.id));
            }
            for (key, id) in dead {
                diffs.remove(key.as_str())?;
                diff_ids.remove(tables::diff_id_key(id).as_str())?;
            }

            let mut traffic = txn.open_table(tables::TRAFFIC)?;
            let mut dead = Vec::new();
            for entry in traffic.range::<&str>(prefix.as_str()..end.as_str())? {
                let (key, _) = entry?;
                dead.push(key.value().to_string());
            }
            for key in dead {
                traffic.remove(key.as_str())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Force every node to `offline` / proxy status `unknown`. Run once at
    /// coordinator boot: sessions from a previous incarnation are dead.
    pub fn reset_all_offline(&self) -> StoreResult<()> {
        let txn = self.db().begin_write()?;
        {
            let mut nodes = txn.open_table(tables::NODES)?;
            let mut updated = Vec::new();
            for entry in nodes.range::<&str>(..)? {
                let (key, raw) = entry?;
                let mut record: NodeRecord = serde_json::from_slice(raw.value())?;
                record.status = NodeStatus::Offline;
                record.xray_status = "unknown".to_string();
                record.updated_at = unix_timestamp();
                updated.push((key.value().to_string(), serde_json::to_vec(&record)?));
            }
            for (key, encoded) in updated {
                nodes.insert(key.as_str(), encoded.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    fn mutate_node(
        &self,
        node_id: i64,
        mutate: impl FnOnce(&mut NodeRecord),
    ) -> StoreResult<()> {
        let txn = self.db().begin_write()?;
        {
            let mut nodes = txn.open_table(tables::NODES)?;
            let mut record: NodeRecord = match nodes.get(node_key(node_id).as_str())? {
                Some(raw) => serde_json::from_slice(raw.value())?,
                None => return Err(StoreError::NodeNotFound(node_id)),
            };
            mutate(&mut record);
            record.updated_at = unix_timestamp();
            let encoded = serde_json::to_vec(&record)?;
            nodes.insert(node_key(node_id).as_str(), encoded.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }
}
