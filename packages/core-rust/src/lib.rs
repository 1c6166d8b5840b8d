//! relstore core: schema registry, relational mapper, relationship field
//! translation, and object-graph batches.

pub mod batch;
pub mod context;
pub mod dissect;
pub mod error;
pub mod model;
pub mod path;
pub mod query;
pub mod registry;
pub mod relationships;
pub mod schema;
pub mod traits;
pub mod types;

pub use batch::{
    reconstruct_created_object, BatchExecutionResult, BatchOperation, CreateObjectDissection,
    CreateObjectOperation, DissectionStep, OperationBatch, Placeholder, PlaceholderTable,
    ReplaceEntry, ResolvedObject, UpdateObjectsOperation,
};
pub use context::{TransactionContext, TransactionId};
pub use dissect::ChildOfDissector;
pub use error::{BatchError, PathError, QueryError, SchemaError};
pub use model::{
    Association, AssociationKind, ColumnReference, ColumnSpec, ColumnType, RelationalModel,
    TableSpec,
};
pub use path::{ObjectPath, PathSegment};
pub use query::{CompareOp, Condition, Direction, Filter, OrderBy};
pub use registry::{Registry, StorageRegistry};
pub use schema::{
    ChildOf, CollectionDefinition, Connects, CustomFieldType, FieldDefinition, FieldType,
    PrimitiveType, Relationship,
};
pub use traits::Dissector;
pub use types::{Object, Value};
