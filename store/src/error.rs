use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Another writer already appended this (node, version). The caller is
    /// expected to recompute `latest_version + 1` and retry.
    #[error("version {version} already exists for node {node_id}")]
    VersionConflict { node_id: i64, version: i64 },

    #[error("node {0} not found")]
    NodeNotFound(i64),

    #[error("node name '{0}' already taken")]
    NameTaken(String),

    #[error("diff {0} not found")]
    DiffNotFound(i64),

    #[error(transparent)]
    Encoding(#[from] serde_json::Error),

    #[error(transparent)]
    Database(#[from] redb::DatabaseError),

    #[error(transparent)]
    Transaction(#[from] redb::TransactionError),

    #[error(transparent)]
    Table(#[from] redb::TableError),

    #[error(transparent)]
    Storage(#[from] redb::StorageError),

    #[error(transparent)]
    Commit(#[from] redb::CommitError),
}
