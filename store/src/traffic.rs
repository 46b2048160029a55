//! Accumulated per-ingress traffic counters.

use redb::ReadableTable;
use serde::{Deserialize, Serialize};
use xfleet_protocol::unix_timestamp;

use crate::error::StoreResult;
use crate::tables::{self, node_prefix, node_prefix_end, traffic_key};
use crate::Store;

/// Running totals for one (node, ingress-tag) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficRecord {
    pub node_id: i64,
    pub inbound_tag: String,
    pub total_uplink: i64,
    pub total_downlink: i64,
    pub updated_at: i64,
}

impl Store {
    /// Upsert-add a report's deltas onto the stored totals.
    ///
    /// Read-modify-write inside a single write transaction; redb serializes
    /// writers, so concurrent reports cannot lose counts.
    pub fn add_traffic(
        &self,
        node_id: i64,
        inbound_tag: &str,
        delta_uplink: i64,
        delta_downlink: i64,
    ) -> StoreResult<()> {
        let txn = self.db().begin_write()?;
        {
            let mut traffic = txn.open_table(tables::TRAFFIC)?;
            let key = traffic_key(node_id, inbound_tag);
            let mut record = match traffic.get(key.as_str())? {
                Some(raw) => serde_json::from_slice::<TrafficRecord>(raw.value())?,
                None => TrafficRecord {
                    node_id,
                    inbound_tag: inbound_tag.to_string(),
                    total_uplink: 0,
                    total_downlink: 0,
                    updated_at: 0,
                },
            };
            record.total_uplink = record.total_uplink.saturating_add(delta_uplink);
            record.total_downlink = record.total_downlink.saturating_add(delta_downlink);
            record.updated_at = unix_timestamp();
            let encoded = serde_json::to_vec(&record)?;
            traffic.insert(key.as_str(), encoded.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Counters for one node, ordered by ingress tag.
    pub fn traffic_for_node(&self, node_id: i64) -> StoreResult<Vec<TrafficRecord>> {
        let txn = self.db().begin_read()?;
        let traffic = txn.open_table(tables::TRAFFIC)?;
        let prefix = node_prefix(node_id);
        let end = node_prefix_end(node_id);
        let mut out = Vec::new();
        for entry in traffic.range::<&str>(prefix.as_str()..end.as_str())? {
            let (_, raw) = entry?;
            out.push(serde_json::from_slice(raw.value())?);
        }
        Ok(out)
    }

    /// Counters for every node, ordered by (node, tag).
    pub fn all_traffic(&self) -> StoreResult<Vec<TrafficRecord>> {
        let txn = self.db().begin_read()?;
        let traffic = txn.open_table(tables::TRAFFIC)?;
        let mut out = Vec::new();
        for entry in traffic.range::<&str>(..)? {
            let (_, raw) = entry?;
            out.push(serde_json::from_slice(raw.value())?);
        }
        Ok(out)
    }
}
