//! Error types for schema construction, paths, queries, and batch execution.

use thiserror::Error;

/// Configuration errors raised while parsing collection definitions or
/// building the relational model.
///
/// These are fatal to startup and never occur at request time.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("unknown field type for field '{field}' of collection '{collection}': '{type_name}'")]
    UnknownFieldType {
        collection: String,
        field: String,
        type_name: String,
    },

    #[error(
        "collection {collection} defines a {kind} relationship '{relationship}' \
         involving non-existing collection {target}"
    )]
    UnknownRelationshipTarget {
        collection: String,
        relationship: String,
        kind: &'static str,
        target: String,
    },

    #[error("invalid identifier '{name}' in collection '{collection}'")]
    InvalidIdentifier { collection: String, name: String },

    #[error("invalid definition for collection '{collection}': {message}")]
    InvalidDefinition { collection: String, message: String },
}

impl SchemaError {
    pub fn unknown_field_type(
        collection: impl Into<String>,
        field: impl Into<String>,
        type_name: impl Into<String>,
    ) -> Self {
        Self::UnknownFieldType {
            collection: collection.into(),
            field: field.into(),
            type_name: type_name.into(),
        }
    }

    pub fn invalid_definition(collection: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidDefinition {
            collection: collection.into(),
            message: message.into(),
        }
    }
}

/// Errors from navigating nested objects by [`ObjectPath`](crate::path::ObjectPath).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("path '{path}' does not exist in the object")]
    NotFound { path: String },

    #[error("path '{path}' does not point at an object")]
    NotAnObject { path: String },

    #[error("cannot write to an empty path")]
    Empty,
}

/// Errors from compiling a caller query into a [`Filter`](crate::query::Filter).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("unknown operator '{operator}' on field '{field}'")]
    UnknownOperator { field: String, operator: String },

    #[error("operator '{operator}' on field '{field}' expects {expected}")]
    InvalidOperand {
        field: String,
        operator: String,
        expected: &'static str,
    },
}

/// Violations of the batch contract detected while executing or
/// reconstructing an [`OperationBatch`](crate::batch::OperationBatch).
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("placeholder '{placeholder}' is referenced before it was resolved")]
    UnresolvedPlaceholder { placeholder: String },

    #[error("placeholder '{placeholder}' is produced more than once in the batch")]
    DuplicatePlaceholder { placeholder: String },

    #[error("row created for placeholder '{placeholder}' has no primary key field '{field}'")]
    MissingPrimaryKey { placeholder: String, field: String },

    #[error("unknown collection in batch: {collection}")]
    UnknownCollection { collection: String },

    #[error(transparent)]
    Path(#[from] PathError),
}
