//! Per-operation options and the named-operation surface.

use relstore_core::{BatchExecutionResult, Object, OperationBatch, OrderBy};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateOptions {
    /// Target database; the default one when `None`.
    pub database: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FindOptions {
    pub database: Option<String>,
    pub order: Vec<OrderBy>,
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CountOptions {
    pub database: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    pub database: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    pub database: Option<String>,
    /// Abort when more than this many objects match.
    pub limit: Option<u64>,
}

impl DeleteOptions {
    #[must_use]
    pub fn limit(limit: u64) -> Self {
        Self {
            database: None,
            limit: Some(limit),
        }
    }
}

/// The request object with every generated primary key written back.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateResult {
    pub object: Object,
}

/// A primitive storage operation addressed by name.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    CreateObject {
        collection: String,
        args: Object,
        options: CreateOptions,
    },
    FindObjects {
        collection: String,
        query: Object,
        options: FindOptions,
    },
    CountObjects {
        collection: String,
        query: Object,
        options: CountOptions,
    },
    UpdateObjects {
        collection: String,
        query: Object,
        updates: Object,
        options: UpdateOptions,
    },
    DeleteObjects {
        collection: String,
        query: Object,
        options: DeleteOptions,
    },
    ExecuteBatch {
        batch: OperationBatch,
    },
}

impl Operation {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::CreateObject { .. } => "createObject",
            Self::FindObjects { .. } => "findObjects",
            Self::CountObjects { .. } => "countObjects",
            Self::UpdateObjects { .. } => "updateObjects",
            Self::DeleteObjects { .. } => "deleteObjects",
            Self::ExecuteBatch { .. } => "executeBatch",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutput {
    Created(CreateResult),
    Objects(Vec<Object>),
    Count(u64),
    /// Rows touched by an update or delete.
    Affected(u64),
    Batch(BatchExecutionResult),
}
