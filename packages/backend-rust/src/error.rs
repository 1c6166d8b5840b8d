//! Backend error type.

use relstore_core::{BatchError, QueryError, SchemaError, Value};

/// Errors surfaced by [`SqlStorageBackend`](crate::SqlStorageBackend).
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("unknown collection: {name}")]
    UnknownCollection { name: String },

    #[error("unknown database: {name}")]
    UnknownDatabase { name: String },

    #[error("storage backend used before a registry was configured")]
    NotConfigured,

    /// A guarded delete matched more rows than allowed. Nothing was deleted.
    #[error(
        "deletion of {collection} matching {query} would remove {actual_count} objects, limit is {limit}"
    )]
    DeletionTooBroad {
        collection: String,
        query: Value,
        limit: u64,
        actual_count: u64,
    },

    #[error("failed to encode {collection}.{field}: {source}")]
    FieldEncoding {
        collection: String,
        field: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("dissection failed: {0}")]
    Dissection(#[source] anyhow::Error),

    #[error("operation targets database {requested} inside a transaction on {active}")]
    TransactionDatabaseMismatch { requested: String, active: String },

    /// Error raised by the relational engine, unchanged.
    #[error(transparent)]
    Engine(#[from] anyhow::Error),
}

impl StorageError {
    pub(crate) fn unknown_collection(name: impl Into<String>) -> Self {
        Self::UnknownCollection { name: name.into() }
    }

    #[must_use]
    pub fn is_deletion_too_broad(&self) -> bool {
        matches!(self, Self::DeletionTooBroad { .. })
    }
}
