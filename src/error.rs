//! Error types for the burrow storage engine

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Record key is empty or exceeds the maximum length.
    /// Rejected before any state change.
    #[error("invalid record key: {0}")]
    InvalidKey(String),

    #[error("invalid bucket name: {0}")]
    InvalidBucketName(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("key field {0:?} not found in record schema")]
    KeyFieldNotFound(String),

    #[error("key field {0:?} must be a string")]
    KeyFieldNotString(String),

    #[error("indexed field {field:?} has unsupported type {kind:?}: only string fields can be indexed")]
    IndexFieldType { field: String, kind: crate::database::record::FieldKind },

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("WAL replay failed at {path:?} (operation {index}): {reason}")]
    WalReplay {
        path: PathBuf,
        index: usize,
        reason: String,
    },

    #[error("flush failed with {pending} pending operations: {reason}")]
    Flush { pending: usize, reason: String },

    /// Per-key failures collected during a batch read.
    #[error("batch read failed for {} of the requested keys", .errors.len())]
    PartialBatch {
        errors: Vec<(String, StoreError)>,
    },

    #[error("{op} failed for {path:?}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("data corruption: {0}")]
    Corruption(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("database is closed")]
    Closed,
}

impl StoreError {
    /// Wrap an OS-level error with the path and operation that hit it.
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            op,
            path: path.into(),
            source,
        }
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
