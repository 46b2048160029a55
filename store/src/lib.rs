//! Coordinator-side persistence for xfleet.
//!
//! A single embedded [`redb`] database holds three logical tables:
//! - **nodes**: per-node identity and liveness record
//! - **diffs**: the append-only, per-node versioned configuration log
//! - **traffic**: accumulated per-ingress byte counters
//!
//! Values are JSON-serialized domain structs; composite string keys are
//! zero-padded so that lexicographic order equals numeric order, which makes
//! an ascending range scan over `diffs` the version-ordered replay stream.
//!
//! The write transaction is the atomicity boundary: diff appends check
//! (node, version) uniqueness inside the transaction that inserts, and the
//! traffic upsert-add reads and rewrites a row in one transaction, so
//! concurrent reports cannot lose counts.

mod diffs;
mod error;
mod nodes;
mod tables;
mod traffic;

use std::path::Path;

use redb::Database;

pub use diffs::DiffRecord;
pub use error::{StoreError, StoreResult};
pub use nodes::{NodeRecord, NodeStatus};
pub use traffic::TrafficRecord;

/// Handle to the coordinator database. Cheap to share behind an `Arc`.
pub struct Store {
    db: Database,
}

impl Store {
    /// Open (or create) the database and make sure every table exists, so
    /// later read transactions never observe a missing table.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db = Database::create(path)?;
        let txn = db.begin_write()?;
        {
            txn.open_table(tables::NODES)?;
            txn.open_table(tables::NODE_NAMES)?;
            txn.open_table(tables::DIFFS)?;
            txn.open_table(tables::DIFF_IDS)?;
            txn.open_table(tables::TRAFFIC)?;
            txn.open_table(tables::META)?;
        }
        txn.commit()?;
        Ok(Self { db })
    }

    pub(crate) fn db(&self) -> &Database {
        &self.db
    }
}
