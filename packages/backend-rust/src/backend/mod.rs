//! The storage backend facade.
//!
//! [`SqlStorageBackend`] owns one [`RelationalEngine`] per named database and
//! the relational model shared by all of them. Every caller-facing payload is
//! translated here: relationship aliases become foreign-key columns and
//! custom fields are encoded on the way in, and the reverse happens to
//! every row read back.

mod batch;
mod guard;
pub mod options;
mod transaction;

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use relstore_core::relationships::{to_logical, to_physical};
use relstore_core::{
    reconstruct_created_object, BatchExecutionResult, ChildOfDissector, CollectionDefinition,
    Dissector, Filter, Object, OperationBatch, RelationalModel, Registry, TableSpec,
    TransactionContext, TransactionId,
};
use tracing::{debug, info};

use crate::config::BackendConfig;
use crate::engine::{MemoryEngine, RelationalEngine};
use crate::error::StorageError;

pub use options::{
    CountOptions, CreateOptions, CreateResult, DeleteOptions, FindOptions, Operation,
    OperationOutput, UpdateOptions,
};
pub use transaction::TransactionScope;

/// Registry plus the relational model built from it.
#[derive(Debug)]
struct ModelState {
    registry: Arc<Registry>,
    model: RelationalModel,
}

impl ModelState {
    fn collection(&self, name: &str) -> Result<(&CollectionDefinition, &TableSpec), StorageError> {
        let definition = self
            .registry
            .collection(name)
            .ok_or_else(|| StorageError::unknown_collection(name))?;
        let table = self
            .model
            .table(name)
            .ok_or_else(|| StorageError::unknown_collection(name))?;
        Ok((definition, table))
    }
}

/// Engine plus the transaction a statement must run in.
struct Target<'s> {
    engine: &'s dyn RelationalEngine,
    txn: Option<TransactionId>,
}

pub struct SqlStorageBackend {
    config: BackendConfig,
    engines: BTreeMap<String, Arc<dyn RelationalEngine>>,
    state: ArcSwapOption<ModelState>,
    dissector: Arc<dyn Dissector>,
}

impl SqlStorageBackend {
    /// Creates a backend over pre-built engines, keyed by database name.
    ///
    /// # Errors
    ///
    /// [`StorageError::UnknownDatabase`] if no engine is registered for the
    /// configured default database.
    pub fn new(
        config: BackendConfig,
        engines: BTreeMap<String, Arc<dyn RelationalEngine>>,
    ) -> Result<Self, StorageError> {
        if !engines.contains_key(&config.default_database) {
            return Err(StorageError::UnknownDatabase {
                name: config.default_database,
            });
        }
        Ok(Self {
            config,
            engines,
            state: ArcSwapOption::empty(),
            dissector: Arc::new(ChildOfDissector::new()),
        })
    }

    /// One [`MemoryEngine`] per configured database.
    #[must_use]
    pub fn in_memory(config: BackendConfig) -> Self {
        let engines = config
            .database_names()
            .into_iter()
            .map(|name| (name, Arc::new(MemoryEngine::new()) as Arc<dyn RelationalEngine>))
            .collect();
        Self {
            config,
            engines,
            state: ArcSwapOption::empty(),
            dissector: Arc::new(ChildOfDissector::new()),
        }
    }

    /// One Postgres pool per configured database. Database names other than
    /// the default are appended to the connection URL's path.
    ///
    /// # Errors
    ///
    /// Fails without a `connection_url` or when a pool cannot connect.
    #[cfg(feature = "postgres")]
    pub async fn connect_postgres(config: BackendConfig) -> Result<Self, StorageError> {
        use crate::engine::PostgresEngine;

        let url = config
            .connection_url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("connection_url is required for the postgres engine"))?;
        let mut engines: BTreeMap<String, Arc<dyn RelationalEngine>> = BTreeMap::new();
        for name in config.database_names() {
            let database_url = if name == config.default_database {
                url.clone()
            } else {
                let base = url.rsplit_once('/').map_or(url.as_str(), |(base, _)| base);
                format!("{base}/{name}")
            };
            let engine =
                PostgresEngine::connect(&database_url, config.max_connections, config.log_statements)
                    .await?;
            engines.insert(name, Arc::new(engine));
        }
        Self::new(config, engines)
    }

    /// Builds the engines `config` asks for: Postgres pools when
    /// `connection_url` is set, one [`MemoryEngine`] per database otherwise.
    ///
    /// # Errors
    ///
    /// Fails when a URL is set but the crate was built without the
    /// `postgres` feature, or when a pool cannot connect.
    pub async fn from_config(config: BackendConfig) -> Result<Self, StorageError> {
        if config.connection_url.is_none() {
            return Ok(Self::in_memory(config));
        }
        #[cfg(feature = "postgres")]
        {
            Self::connect_postgres(config).await
        }
        #[cfg(not(feature = "postgres"))]
        {
            Err(anyhow::anyhow!("connection_url is set but the postgres feature is disabled").into())
        }
    }

    /// Replaces the dissector used by [`create_object`](Self::create_object).
    #[must_use]
    pub fn with_dissector(mut self, dissector: Arc<dyn Dissector>) -> Self {
        self.dissector = dissector;
        self
    }

    #[must_use]
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn databases(&self) -> impl Iterator<Item = &str> {
        self.engines.keys().map(String::as_str)
    }

    /// The registry currently in effect, if any.
    #[must_use]
    pub fn registry(&self) -> Option<Arc<Registry>> {
        self.state.load_full().map(|state| Arc::clone(&state.registry))
    }

    /// Builds the relational model for `registry` and makes it current.
    ///
    /// Configuring the registry that is already current is a no-op.
    ///
    /// # Errors
    ///
    /// Any [`SchemaError`](relstore_core::SchemaError) from the mapper; the
    /// previous model stays in effect.
    pub fn configure(&self, registry: Arc<Registry>) -> Result<(), StorageError> {
        if let Some(current) = self.state.load_full() {
            if Arc::ptr_eq(&current.registry, &registry) {
                return Ok(());
            }
        }
        let model = RelationalModel::build(&registry)?;
        info!(
            collections = registry.collections().count(),
            databases = self.engines.len(),
            "storage backend configured"
        );
        self.state.store(Some(Arc::new(ModelState { registry, model })));
        Ok(())
    }

    /// Creates missing tables on one database, or on all of them.
    ///
    /// # Errors
    ///
    /// [`StorageError::NotConfigured`], [`StorageError::UnknownDatabase`], or
    /// the engine's error.
    pub async fn migrate(&self, database: Option<&str>) -> Result<(), StorageError> {
        let state = self.state()?;
        let targets: Vec<(&String, &Arc<dyn RelationalEngine>)> = match database {
            Some(name) => vec![self.engine_entry(Some(name))?],
            None => self.engines.iter().collect(),
        };
        for (name, engine) in targets {
            engine.sync(&state.model).await?;
            info!(database = %name, engine = engine.name(), "migrated database");
        }
        Ok(())
    }

    /// Creates an object graph in one transaction on the target database.
    ///
    /// # Errors
    ///
    /// Any error from dissection, batch execution, or the engine. Nothing
    /// from the request is stored when an error is returned.
    pub async fn create_object(
        &self,
        collection: &str,
        args: Object,
        options: &CreateOptions,
    ) -> Result<CreateResult, StorageError> {
        self.transaction_on(options.database.as_deref(), |tx| async move {
            tx.create_object(collection, args).await
        })
        .await
    }

    /// # Errors
    ///
    /// Unknown collection, invalid query, or the engine's error.
    pub async fn find_objects(
        &self,
        collection: &str,
        query: &Object,
        options: &FindOptions,
    ) -> Result<Vec<Object>, StorageError> {
        self.find_in(collection, query, options, None).await
    }

    /// First object matching `query`, in `options.order`.
    ///
    /// # Errors
    ///
    /// Same as [`find_objects`](Self::find_objects).
    pub async fn find_object(
        &self,
        collection: &str,
        query: &Object,
        options: &FindOptions,
    ) -> Result<Option<Object>, StorageError> {
        self.find_one_in(collection, query, options, None).await
    }

    /// # Errors
    ///
    /// Same as [`find_objects`](Self::find_objects).
    pub async fn count_objects(
        &self,
        collection: &str,
        query: &Object,
        options: &CountOptions,
    ) -> Result<u64, StorageError> {
        self.count_in(collection, query, options, None).await
    }

    /// Applies `updates` to every object matching `query`. Returns the count.
    ///
    /// # Errors
    ///
    /// Unknown collection, invalid query, a failed field encoding, or the
    /// engine's error.
    pub async fn update_objects(
        &self,
        collection: &str,
        query: &Object,
        updates: Object,
        options: &UpdateOptions,
    ) -> Result<u64, StorageError> {
        self.update_in(collection, query, updates, options, None).await
    }

    /// Deletes every object matching `query`, guarded by `options.limit`.
    ///
    /// # Errors
    ///
    /// [`StorageError::DeletionTooBroad`] when more objects match than the
    /// limit allows; nothing is deleted in that case.
    pub async fn delete_objects(
        &self,
        collection: &str,
        query: &Object,
        options: &DeleteOptions,
    ) -> Result<u64, StorageError> {
        self.delete_in(collection, query, options, None).await
    }

    /// Runs `batch` in one transaction on the default database.
    ///
    /// # Errors
    ///
    /// The first failing operation's error, after rolling back every
    /// operation of the batch.
    pub async fn execute_batch(
        &self,
        batch: &OperationBatch,
    ) -> Result<BatchExecutionResult, StorageError> {
        self.transaction(|tx| async move { tx.execute_batch(batch).await })
            .await
    }

    /// Dispatches a named operation as a standalone call.
    ///
    /// # Errors
    ///
    /// Whatever the dispatched operation returns.
    pub async fn operation(&self, operation: Operation) -> Result<OperationOutput, StorageError> {
        debug!(operation = operation.name(), "dispatching operation");
        match operation {
            Operation::CreateObject {
                collection,
                args,
                options,
            } => self
                .create_object(&collection, args, &options)
                .await
                .map(OperationOutput::Created),
            Operation::ExecuteBatch { batch } => {
                self.execute_batch(&batch).await.map(OperationOutput::Batch)
            }
            other => self.dispatch_in(other, None).await,
        }
    }

    // -----------------------------------------------------------------------
    // Shared internals. `ctx` is the active transaction, if any.
    // -----------------------------------------------------------------------

    fn state(&self) -> Result<Arc<ModelState>, StorageError> {
        self.state.load_full().ok_or(StorageError::NotConfigured)
    }

    fn engine_entry(
        &self,
        database: Option<&str>,
    ) -> Result<(&String, &Arc<dyn RelationalEngine>), StorageError> {
        let name = database.unwrap_or(&self.config.default_database);
        self.engines
            .get_key_value(name)
            .ok_or_else(|| StorageError::UnknownDatabase {
                name: name.to_string(),
            })
    }

    fn target(
        &self,
        database: Option<&str>,
        ctx: Option<&TransactionContext>,
    ) -> Result<Target<'_>, StorageError> {
        match ctx {
            Some(ctx) => {
                if let Some(requested) = database {
                    if requested != ctx.database {
                        return Err(StorageError::TransactionDatabaseMismatch {
                            requested: requested.to_string(),
                            active: ctx.database.clone(),
                        });
                    }
                }
                let (_, engine) = self.engine_entry(Some(&ctx.database))?;
                Ok(Target {
                    engine: engine.as_ref(),
                    txn: Some(ctx.id),
                })
            }
            None => {
                let (_, engine) = self.engine_entry(database)?;
                Ok(Target {
                    engine: engine.as_ref(),
                    txn: None,
                })
            }
        }
    }

    /// Dispatches the operations that never open a transaction of their own.
    async fn dispatch_in(
        &self,
        operation: Operation,
        ctx: Option<&TransactionContext>,
    ) -> Result<OperationOutput, StorageError> {
        match operation {
            Operation::FindObjects {
                collection,
                query,
                options,
            } => self
                .find_in(&collection, &query, &options, ctx)
                .await
                .map(OperationOutput::Objects),
            Operation::CountObjects {
                collection,
                query,
                options,
            } => self
                .count_in(&collection, &query, &options, ctx)
                .await
                .map(OperationOutput::Count),
            Operation::UpdateObjects {
                collection,
                query,
                updates,
                options,
            } => self
                .update_in(&collection, &query, updates, &options, ctx)
                .await
                .map(OperationOutput::Affected),
            Operation::DeleteObjects {
                collection,
                query,
                options,
            } => self
                .delete_in(&collection, &query, &options, ctx)
                .await
                .map(OperationOutput::Affected),
            Operation::CreateObject {
                collection,
                args,
                options,
            } => {
                let ctx = ctx.ok_or_else(|| {
                    anyhow::anyhow!("createObject dispatched without a transaction")
                })?;
                self.target(options.database.as_deref(), Some(ctx))?;
                self.create_complex(&collection, args, ctx)
                    .await
                    .map(OperationOutput::Created)
            }
            Operation::ExecuteBatch { batch } => {
                let ctx = ctx.ok_or_else(|| {
                    anyhow::anyhow!("executeBatch dispatched without a transaction")
                })?;
                self.run_batch(&batch, ctx).await.map(OperationOutput::Batch)
            }
        }
    }

    /// Dissects `args`, runs the resulting batch under `ctx`, and writes the
    /// generated keys back into `args`.
    async fn create_complex(
        &self,
        collection: &str,
        mut args: Object,
        ctx: &TransactionContext,
    ) -> Result<CreateResult, StorageError> {
        let state = self.state()?;
        state.collection(collection)?;
        let (batch, dissection) = self
            .dissector
            .dissect(&state.registry, collection, &args)
            .map_err(StorageError::Dissection)?;
        debug!(
            collection = %collection,
            operations = batch.len(),
            txn = %ctx.id,
            "dissected create request"
        );
        let result = self.run_batch(&batch, ctx).await?;
        reconstruct_created_object(&mut args, &dissection, &result, &state.registry)?;
        Ok(CreateResult { object: args })
    }

    /// Single-row insert without dissection. Returns the logical row.
    async fn raw_create(
        &self,
        state: &ModelState,
        collection: &str,
        args: Object,
        ctx: &TransactionContext,
    ) -> Result<Object, StorageError> {
        let (definition, table) = state.collection(collection)?;
        let target = self.target(None, Some(ctx))?;
        let values = encode_row(definition, args)?;
        let row = target.engine.create(table, values, target.txn).await?;
        decode_row(definition, row)
    }

    async fn find_in(
        &self,
        collection: &str,
        query: &Object,
        options: &FindOptions,
        ctx: Option<&TransactionContext>,
    ) -> Result<Vec<Object>, StorageError> {
        let state = self.state()?;
        let (definition, table) = state.collection(collection)?;
        let target = self.target(options.database.as_deref(), ctx)?;
        let filter = compile_query(definition, query)?;
        let rows = target
            .engine
            .find_all(table, &filter, &options.order, options.limit, target.txn)
            .await?;
        debug!(collection = %collection, rows = rows.len(), "found objects");
        rows.into_iter()
            .map(|row| decode_row(definition, row))
            .collect()
    }

    async fn find_one_in(
        &self,
        collection: &str,
        query: &Object,
        options: &FindOptions,
        ctx: Option<&TransactionContext>,
    ) -> Result<Option<Object>, StorageError> {
        let options = FindOptions {
            limit: Some(1),
            ..options.clone()
        };
        Ok(self
            .find_in(collection, query, &options, ctx)
            .await?
            .into_iter()
            .next())
    }

    async fn count_in(
        &self,
        collection: &str,
        query: &Object,
        options: &CountOptions,
        ctx: Option<&TransactionContext>,
    ) -> Result<u64, StorageError> {
        let state = self.state()?;
        let (definition, table) = state.collection(collection)?;
        let target = self.target(options.database.as_deref(), ctx)?;
        let filter = compile_query(definition, query)?;
        Ok(target.engine.count(table, &filter, target.txn).await?)
    }

    async fn update_in(
        &self,
        collection: &str,
        query: &Object,
        updates: Object,
        options: &UpdateOptions,
        ctx: Option<&TransactionContext>,
    ) -> Result<u64, StorageError> {
        let state = self.state()?;
        let (definition, table) = state.collection(collection)?;
        let target = self.target(options.database.as_deref(), ctx)?;
        let filter = compile_query(definition, query)?;
        let values = encode_row(definition, updates)?;
        let affected = target
            .engine
            .update(table, values, &filter, target.txn)
            .await?;
        debug!(collection = %collection, affected, "updated objects");
        Ok(affected)
    }
}

/// Translates a caller query to physical columns and compiles it.
fn compile_query(definition: &CollectionDefinition, query: &Object) -> Result<Filter, StorageError> {
    let physical = to_physical(query.clone(), definition);
    Ok(Filter::from_query(&physical)?)
}

fn encode_row(definition: &CollectionDefinition, object: Object) -> Result<Object, StorageError> {
    let mut physical = to_physical(object, definition);
    definition
        .prepare_for_storage(&mut physical)
        .map_err(|(field, source)| StorageError::FieldEncoding {
            collection: definition.name.clone(),
            field,
            source,
        })?;
    Ok(physical)
}

fn decode_row(definition: &CollectionDefinition, mut row: Object) -> Result<Object, StorageError> {
    definition
        .prepare_from_storage(&mut row)
        .map_err(|(field, source)| StorageError::FieldEncoding {
            collection: definition.name.clone(),
            field,
            source,
        })?;
    Ok(to_logical(row, definition))
}
