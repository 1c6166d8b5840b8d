//! Deletion limit guard.
//!
//! The count and the delete are two statements. Outside a transaction a
//! concurrent writer can add matching rows between them, so a guarded
//! delete may remove slightly more than `limit`. Inside a transaction both
//! statements share it.

use relstore_core::{Object, TransactionContext, Value};
use tracing::{debug, warn};

use super::{compile_query, DeleteOptions, SqlStorageBackend};
use crate::error::StorageError;

impl SqlStorageBackend {
    pub(super) async fn delete_in(
        &self,
        collection: &str,
        query: &Object,
        options: &DeleteOptions,
        ctx: Option<&TransactionContext>,
    ) -> Result<u64, StorageError> {
        let state = self.state()?;
        let (definition, table) = state.collection(collection)?;
        let target = self.target(options.database.as_deref(), ctx)?;
        let filter = compile_query(definition, query)?;

        if let Some(limit) = options.limit {
            let actual_count = target.engine.count(table, &filter, target.txn).await?;
            if actual_count > limit {
                warn!(
                    collection = %collection,
                    limit,
                    actual_count,
                    "refusing deletion above limit"
                );
                return Err(StorageError::DeletionTooBroad {
                    collection: collection.to_string(),
                    query: Value::Object(query.clone()),
                    limit,
                    actual_count,
                });
            }
        }

        let deleted = target.engine.destroy(table, &filter, target.txn).await?;
        debug!(collection = %collection, deleted, "deleted objects");
        Ok(deleted)
    }
}
