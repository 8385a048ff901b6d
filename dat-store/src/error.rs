//! Error types of the store and the ingestion pipeline.

use std::io;

/// Errors returned by [`crate::Store`] operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The row does not exist. This is a normal outcome, e.g. when detecting new rows.
    #[error("row not found: {0}")]
    NotFound(String),
    /// A write was rejected because of a concurrent revision.
    ///
    /// Reserved: with a single writer all writes resolve to successor revisions.
    #[error("revision conflict for row {0}")]
    Conflict(String),
    /// Resolving the stored revision of a row in a merge-mode or replicated batch
    /// failed. Nothing of the batch was written.
    #[error("failed to look up existing row {id}: {source}")]
    BatchLookup {
        /// The row whose lookup failed.
        id: String,
        /// What went wrong.
        #[source]
        source: Box<StoreError>,
    },
    /// The underlying database failed. A failed grouped write persists nothing.
    #[error("storage error: {0}")]
    Storage(#[from] redb::Error),
    /// New columns could not be persisted.
    #[error("failed to add columns: {0}")]
    SchemaUpdate(#[source] redb::Error),
    /// Stored data could not be interpreted.
    #[error("corrupt entry: {0}")]
    Corrupt(String),
    /// The operation needs a store without rows or columns.
    #[error("store is not empty")]
    NotEmpty,
    /// A blocking database task panicked or was cancelled.
    #[error("database task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl StoreError {
    /// Whether this is [`StoreError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<redb::DatabaseError> for StoreError {
    fn from(value: redb::DatabaseError) -> Self {
        Self::Storage(value.into())
    }
}

impl From<redb::TransactionError> for StoreError {
    fn from(value: redb::TransactionError) -> Self {
        Self::Storage(value.into())
    }
}

impl From<redb::TableError> for StoreError {
    fn from(value: redb::TableError) -> Self {
        Self::Storage(value.into())
    }
}

impl From<redb::StorageError> for StoreError {
    fn from(value: redb::StorageError) -> Self {
        Self::Storage(value.into())
    }
}

impl From<redb::CommitError> for StoreError {
    fn from(value: redb::CommitError) -> Self {
        Self::Storage(value.into())
    }
}

/// Errors that stop an ingestion pipeline.
///
/// Failures of single records are reported as row outcomes instead.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Reading the input failed.
    #[error("failed to read input: {0}")]
    Input(#[from] io::Error),
    /// A batch could not be committed, or its columns could not be declared.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The requested input format is not supported.
    #[error("unknown input format {0:?}")]
    UnknownFormat(String),
    /// The configured primary key is not a known column.
    #[error("primary key {0:?} is not a known column")]
    UnknownPrimary(String),
    /// The input does not match the selected format.
    #[error("input does not match format {format}: {reason}")]
    Format {
        /// The selected input format.
        format: crate::formats::InputFormat,
        /// What was wrong.
        reason: String,
    },
    /// A commit task panicked or was cancelled.
    #[error("commit task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
