//! Transaction coordinator.

use std::future::Future;

use relstore_core::{
    BatchExecutionResult, Object, OperationBatch, TransactionContext, TransactionId,
};
use tracing::{debug, warn};

use super::{
    CountOptions, CreateResult, DeleteOptions, FindOptions, Operation, OperationOutput,
    SqlStorageBackend, UpdateOptions,
};
use crate::engine::RelationalEngine;
use crate::error::StorageError;

/// Abandons the transaction on drop unless it was finished first.
///
/// Fires when the runner future is cancelled mid-flight, so a timeout or a
/// dropped task never leaves the engine holding the transaction.
struct PendingTransaction<'e> {
    engine: &'e dyn RelationalEngine,
    id: TransactionId,
    finished: bool,
}

impl<'e> PendingTransaction<'e> {
    fn new(engine: &'e dyn RelationalEngine, id: TransactionId) -> Self {
        Self {
            engine,
            id,
            finished: false,
        }
    }

    fn finish(&mut self) {
        self.finished = true;
    }
}

impl Drop for PendingTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(txn = %self.id, engine = self.engine.name(), "transaction dropped before completion");
            self.engine.abandon(self.id);
        }
    }
}

impl SqlStorageBackend {
    /// Runs `runner` inside one transaction on the default database.
    ///
    /// Commits when the runner returns `Ok`. On `Err` every write made
    /// through the scope is rolled back and the runner's error is returned
    /// unchanged; a failing rollback is only logged.
    ///
    /// # Errors
    ///
    /// The runner's error, or a [`StorageError`] from begin/commit.
    pub async fn transaction<'a, F, Fut, T, E>(&'a self, runner: F) -> Result<T, E>
    where
        F: FnOnce(TransactionScope<'a>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<StorageError>,
    {
        self.transaction_on(None, runner).await
    }

    /// Like [`transaction`](Self::transaction), on a named database.
    ///
    /// # Errors
    ///
    /// [`StorageError::UnknownDatabase`] for an unconfigured name, otherwise
    /// as [`transaction`](Self::transaction).
    pub async fn transaction_on<'a, F, Fut, T, E>(
        &'a self,
        database: Option<&str>,
        runner: F,
    ) -> Result<T, E>
    where
        F: FnOnce(TransactionScope<'a>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<StorageError>,
    {
        let (name, engine) = self.engine_entry(database)?;
        let id = engine.begin().await.map_err(StorageError::Engine)?;
        let mut pending = PendingTransaction::new(&**engine, id);
        let ctx = TransactionContext::new(id, name.as_str());
        debug!(txn = %id, database = %name, "transaction started");

        match runner(TransactionScope { backend: self, ctx }).await {
            Ok(value) => {
                let committed = engine.commit(id).await;
                pending.finish();
                committed.map_err(StorageError::Engine)?;
                debug!(txn = %id, "transaction committed");
                Ok(value)
            }
            Err(err) => {
                let rolled_back = engine.rollback(id).await;
                pending.finish();
                match rolled_back {
                    Ok(()) => warn!(txn = %id, database = %name, "transaction rolled back"),
                    Err(rollback_err) => warn!(
                        txn = %id,
                        database = %name,
                        error = %rollback_err,
                        "transaction rollback failed"
                    ),
                }
                Err(err)
            }
        }
    }
}

/// Handle given to a transaction runner. Every operation issued through it
/// runs in the surrounding transaction.
#[derive(Clone)]
pub struct TransactionScope<'a> {
    backend: &'a SqlStorageBackend,
    ctx: TransactionContext,
}

impl<'a> TransactionScope<'a> {
    #[must_use]
    pub fn context(&self) -> &TransactionContext {
        &self.ctx
    }

    #[must_use]
    pub fn backend(&self) -> &'a SqlStorageBackend {
        self.backend
    }

    /// Dispatches a named operation tagged with this transaction.
    ///
    /// # Errors
    ///
    /// Whatever the dispatched operation returns.
    pub async fn operation(&self, operation: Operation) -> Result<OperationOutput, StorageError> {
        debug!(operation = operation.name(), txn = %self.ctx.id, "dispatching scoped operation");
        self.backend.dispatch_in(operation, Some(&self.ctx)).await
    }

    /// Calls `f` with a copy of this scope.
    ///
    /// The scope carries the backend and the transaction context, and every
    /// operation `f` issues through it joins the surrounding transaction.
    pub async fn call<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce(TransactionScope<'a>) -> Fut,
        Fut: Future<Output = T>,
    {
        f(self.clone()).await
    }

    /// # Errors
    ///
    /// As [`SqlStorageBackend::create_object`].
    pub async fn create_object(
        &self,
        collection: &str,
        args: Object,
    ) -> Result<CreateResult, StorageError> {
        self.backend.create_complex(collection, args, &self.ctx).await
    }

    /// # Errors
    ///
    /// As [`SqlStorageBackend::find_objects`].
    pub async fn find_objects(
        &self,
        collection: &str,
        query: &Object,
        options: &FindOptions,
    ) -> Result<Vec<Object>, StorageError> {
        self.backend
            .find_in(collection, query, options, Some(&self.ctx))
            .await
    }

    /// # Errors
    ///
    /// As [`SqlStorageBackend::find_object`].
    pub async fn find_object(
        &self,
        collection: &str,
        query: &Object,
        options: &FindOptions,
    ) -> Result<Option<Object>, StorageError> {
        self.backend
            .find_one_in(collection, query, options, Some(&self.ctx))
            .await
    }

    /// # Errors
    ///
    /// As [`SqlStorageBackend::count_objects`].
    pub async fn count_objects(
        &self,
        collection: &str,
        query: &Object,
        options: &CountOptions,
    ) -> Result<u64, StorageError> {
        self.backend
            .count_in(collection, query, options, Some(&self.ctx))
            .await
    }

    /// # Errors
    ///
    /// As [`SqlStorageBackend::update_objects`].
    pub async fn update_objects(
        &self,
        collection: &str,
        query: &Object,
        updates: Object,
        options: &UpdateOptions,
    ) -> Result<u64, StorageError> {
        self.backend
            .update_in(collection, query, updates, options, Some(&self.ctx))
            .await
    }

    /// # Errors
    ///
    /// As [`SqlStorageBackend::delete_objects`].
    pub async fn delete_objects(
        &self,
        collection: &str,
        query: &Object,
        options: &DeleteOptions,
    ) -> Result<u64, StorageError> {
        self.backend
            .delete_in(collection, query, options, Some(&self.ctx))
            .await
    }

    /// # Errors
    ///
    /// As [`SqlStorageBackend::execute_batch`].
    pub async fn execute_batch(
        &self,
        batch: &OperationBatch,
    ) -> Result<BatchExecutionResult, StorageError> {
        self.backend.run_batch(batch, &self.ctx).await
    }
}
