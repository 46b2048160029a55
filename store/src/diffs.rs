//! The append-only per-node diff log.
//!
//! Versions are writer-allocated as `latest_version(node) + 1`; two racing
//! writers can compute the same next version, so [`Store::append_diff`]
//! rejects a (node, version) collision and the loser retries. The log is
//! the source of truth for a node's configuration; there is no separate
//! "current state" table.

use redb::ReadableTable;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use xfleet_protocol::{unix_timestamp, ConfigAction, ConfigKind};

use crate::error::{StoreError, StoreResult};
use crate::tables::{self, diff_id_key, diff_key, node_key, node_prefix, node_prefix_end};
use crate::Store;

/// One immutable configuration change record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffRecord {
    pub id: i64,
    pub node_id: i64,
    pub version: i64,
    pub kind: ConfigKind,
    pub action: ConfigAction,
    /// Opaque JSON object; always carries a `tag` (routing: `outboundTag`).
    pub content: Value,
    pub created_at: i64,
}

impl Store {
    /// Append a diff at `version`. Fails with [`StoreError::VersionConflict`]
    /// if the slot is taken: the caller lost a race and retries with a
    /// fresh `latest_version + 1`.
    pub fn append_diff(
        &self,
        node_id: i64,
        version: i64,
        kind: ConfigKind,
        action: ConfigAction,
        content: Value,
    ) -> StoreResult<DiffRecord> {
        let txn = self.db().begin_write()?;
        let record = {
            let nodes = txn.open_table(tables::NODES)?;
            if nodes.get(node_key(node_id).as_str())?.is_none() {
                return Err(StoreError::NodeNotFound(node_id));
            }

            let mut diffs = txn.open_table(tables::DIFFS)?;
            let key = diff_key(node_id, version);
            if diffs.get(key.as_str())?.is_some() {
                return Err(StoreError::VersionConflict { node_id, version });
            }

            let mut meta = txn.open_table(tables::META)?;
            let id = meta.get("next_diff_id")?.map(|v| v.value()).unwrap_or(1) as i64;
            meta.insert("next_diff_id", id as u64 + 1)?;

            let record = DiffRecord {
                id,
                node_id,
                version,
                kind,
                action,
                content,
                created_at: unix_timestamp(),
            };
            let encoded = serde_json::to_vec(&record)?;
            diffs.insert(key.as_str(), encoded.as_slice())?;

            let mut diff_ids = txn.open_table(tables::DIFF_IDS)?;
            diff_ids.insert(diff_id_key(id).as_str(), key.as_str())?;
            record
        };
        txn.commit()?;
        Ok(record)
    }

    /// Max version recorded for a node, 0 if it has no diffs.
    pub fn latest_version(&self, node_id: i64) -> StoreResult<i64> {
        let txn = self.db().begin_read()?;
        let diffs = txn.open_table(tables::DIFFS)?;
        let prefix = node_prefix(node_id);
        let end = node_prefix_end(node_id);
        match diffs.range::<&str>(prefix.as_str()..end.as_str())?.next_back() {
            Some(entry) => {
                let (_, raw) = entry?;
                let record: DiffRecord = serde_json::from_slice(raw.value())?;
                Ok(record.version)
            }
            None => Ok(0),
        }
    }

    /// All diffs with `version > from_version`, ascending. The ordering is
    /// load-bearing: the projector replays exactly this stream.
    pub fn list_diffs_after(&self, node_id: i64, from_version: i64) -> StoreResult<Vec<DiffRecord>> {
        self.scan_diffs(node_id, from_version, None)
    }

    /// Same as [`Store::list_diffs_after`], filtered to one kind.
    pub fn list_diffs_by_kind_after(
        &self,
        node_id: i64,
        kind: ConfigKind,
        from_version: i64,
    ) -> StoreResult<Vec<DiffRecord>> {
        self.scan_diffs(node_id, from_version, Some(kind))
    }

    pub fn get_diff(&self, diff_id: i64) -> StoreResult<DiffRecord> {
        let txn = self.db().begin_read()?;
        let diff_ids = txn.open_table(tables::DIFF_IDS)?;
        let Some(key) = diff_ids.get(diff_id_key(diff_id).as_str())? else {
            return Err(StoreError::DiffNotFound(diff_id));
        };
        let diffs = txn.open_table(tables::DIFFS)?;
        match diffs.get(key.value())? {
            Some(raw) => Ok(serde_json::from_slice(raw.value())?),
            None => Err(StoreError::DiffNotFound(diff_id)),
        }
    }

    fn scan_diffs(
        &self,
        node_id: i64,
        from_version: i64,
        kind: Option<ConfigKind>,
    ) -> StoreResult<Vec<DiffRecord>> {
        let txn = self.db().begin_read()?;
        let diffs = txn.open_table(tables::DIFFS)?;
        // strictly greater than from_version
        let start = diff_key(node_id, from_version.saturating_add(1));
        let end = node_prefix_end(node_id);
        let mut out = Vec::new();
        for entry in diffs.range::<&str>(start.as_str()..end.as_str())? {
            let (_, raw) = entry?;
            let record: DiffRecord = serde_json::from_slice(raw.value())?;
            if kind.is_none_or(|k| k == record.kind) {
                out.push(record);
            }
        }
        Ok(out)
    }
}
