//! relstore backend: relational engines, the transaction coordinator, and
//! object-graph batch execution on top of `relstore-core`.

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod telemetry;

pub use backend::{
    CountOptions, CreateOptions, CreateResult, DeleteOptions, FindOptions, Operation,
    OperationOutput, SqlStorageBackend, TransactionScope, UpdateOptions,
};
pub use config::{BackendArgs, BackendConfig};
pub use engine::memory::MemoryEngineError;
pub use engine::{MemoryEngine, RelationalEngine};
#[cfg(feature = "postgres")]
pub use engine::PostgresEngine;
pub use error::StorageError;
