//! In-memory [`RelationalEngine`].
//!
//! Committed tables live behind a `parking_lot::RwLock`. A transaction works
//! on a private snapshot of every table and holds the single writer lock
//! until it commits or rolls back, so transactions are serializable and
//! standalone writes wait for the active transaction to finish. Readers
//! outside a transaction only ever see committed state.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use relstore_core::query::sort_rows;
use relstore_core::{Filter, Object, OrderBy, RelationalModel, TableSpec, TransactionId, Value};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use super::RelationalEngine;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MemoryEngineError {
    #[error("table {table} does not exist")]
    UnknownTable { table: String },

    #[error("column {table}.{column} does not exist")]
    UnknownColumn { table: String, column: String },

    #[error("null value in column {table}.{column} violates not-null constraint")]
    NotNull { table: String, column: String },

    #[error("duplicate key {value} in {table}.{column}")]
    DuplicateKey {
        table: String,
        column: String,
        value: String,
    },

    #[error("transaction {id} is not active")]
    UnknownTransaction { id: TransactionId },
}

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    rows: Vec<Object>,
    /// Last generated value per auto-increment column.
    sequences: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    tables: BTreeMap<String, MemoryTable>,
}

impl MemoryState {
    fn table(&self, spec: &TableSpec) -> Result<&MemoryTable, MemoryEngineError> {
        self.tables
            .get(&spec.name)
            .ok_or_else(|| MemoryEngineError::UnknownTable {
                table: spec.name.clone(),
            })
    }

    fn table_mut(&mut self, spec: &TableSpec) -> Result<&mut MemoryTable, MemoryEngineError> {
        self.tables
            .get_mut(&spec.name)
            .ok_or_else(|| MemoryEngineError::UnknownTable {
                table: spec.name.clone(),
            })
    }

    fn insert(&mut self, spec: &TableSpec, values: Object) -> Result<Object, MemoryEngineError> {
        let table = self.table_mut(spec)?;
        let mut row = Object::new();
        for column in &spec.columns {
            let value = values.get(&column.name).cloned().unwrap_or(Value::Null);
            row.insert(column.name.clone(), value);
        }

        for column in spec.columns.iter().filter(|c| c.auto_increment) {
            let last = table.sequences.entry(column.name.clone()).or_default();
            match row.get(&column.name) {
                Some(Value::Null) | None => {
                    *last += 1;
                    row.insert(column.name.clone(), Value::from(*last));
                }
                Some(supplied) => {
                    if let Some(id) = supplied.as_i64() {
                        *last = (*last).max(id);
                    }
                }
            }
        }

        if let Some(pk) = spec.primary_key_column() {
            let key = row.get(&pk.name).cloned().unwrap_or(Value::Null);
            if !key.is_null() && table.rows.iter().any(|existing| existing.get(&pk.name) == Some(&key)) {
                return Err(MemoryEngineError::DuplicateKey {
                    table: spec.name.clone(),
                    column: pk.name.clone(),
                    value: key.to_string(),
                });
            }
        }

        check_not_null(spec, &row)?;
        table.rows.push(row.clone());
        Ok(row)
    }

    fn update(
        &mut self,
        spec: &TableSpec,
        values: &Object,
        filter: &Filter,
    ) -> Result<u64, MemoryEngineError> {
        check_filter(spec, filter)?;
        let changes: Vec<(&String, &Value)> = values
            .iter()
            .filter(|(name, _)| spec.has_column(name))
            .collect();
        for (name, value) in &changes {
            if value.is_null() && spec.column(name).is_some_and(|c| !c.nullable) {
                return Err(MemoryEngineError::NotNull {
                    table: spec.name.clone(),
                    column: (*name).clone(),
                });
            }
        }

        let table = self.table_mut(spec)?;
        let mut affected = 0;
        for row in table.rows.iter_mut().filter(|row| filter.matches(row)) {
            for (name, value) in &changes {
                row.insert((*name).clone(), (*value).clone());
            }
            affected += 1;
        }
        Ok(affected)
    }

    fn destroy(&mut self, spec: &TableSpec, filter: &Filter) -> Result<u64, MemoryEngineError> {
        check_filter(spec, filter)?;
        let table = self.table_mut(spec)?;
        let before = table.rows.len();
        table.rows.retain(|row| !filter.matches(row));
        Ok((before - table.rows.len()) as u64)
    }

    fn select(
        &self,
        spec: &TableSpec,
        filter: &Filter,
        order: &[OrderBy],
        limit: Option<u64>,
    ) -> Result<Vec<Object>, MemoryEngineError> {
        check_filter(spec, filter)?;
        for key in order {
            check_column(spec, &key.field)?;
        }
        let mut rows: Vec<Object> = self
            .table(spec)?
            .rows
            .iter()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect();
        sort_rows(&mut rows, order);
        if let Some(limit) = limit {
            rows.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        }
        Ok(rows)
    }

    fn count(&self, spec: &TableSpec, filter: &Filter) -> Result<u64, MemoryEngineError> {
        check_filter(spec, filter)?;
        let matching = self.table(spec)?.rows.iter().filter(|row| filter.matches(row)).count();
        Ok(matching as u64)
    }
}

fn check_column(spec: &TableSpec, column: &str) -> Result<(), MemoryEngineError> {
    if spec.has_column(column) {
        Ok(())
    } else {
        Err(MemoryEngineError::UnknownColumn {
            table: spec.name.clone(),
            column: column.to_string(),
        })
    }
}

fn check_filter(spec: &TableSpec, filter: &Filter) -> Result<(), MemoryEngineError> {
    filter
        .conditions
        .iter()
        .try_for_each(|condition| check_column(spec, &condition.field))
}

fn check_not_null(spec: &TableSpec, row: &Object) -> Result<(), MemoryEngineError> {
    for column in spec.columns.iter().filter(|c| !c.nullable) {
        if row.get(&column.name).is_none_or(Value::is_null) {
            return Err(MemoryEngineError::NotNull {
                table: spec.name.clone(),
                column: column.name.clone(),
            });
        }
    }
    Ok(())
}

struct MemoryTransaction {
    state: MemoryState,
    _writer: OwnedMutexGuard<()>,
}

/// Relational engine keeping every table in process memory.
///
/// A transaction works on a snapshot and publishes it on commit. Writers are
/// serialized: an open transaction holds the writer lock until it finishes,
/// and a write without a transaction waits for it. A runner must therefore
/// write through its own transaction, never around it.
pub struct MemoryEngine {
    committed: RwLock<MemoryState>,
    writer: Arc<Mutex<()>>,
    transactions: DashMap<u64, MemoryTransaction>,
    next_transaction: AtomicU64,
}

impl MemoryEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            committed: RwLock::new(MemoryState::default()),
            writer: Arc::new(Mutex::new(())),
            transactions: DashMap::new(),
            next_transaction: AtomicU64::new(1),
        }
    }

    /// Number of transactions currently open.
    #[must_use]
    pub fn active_transactions(&self) -> usize {
        self.transactions.len()
    }

    fn read<R>(
        &self,
        txn: Option<TransactionId>,
        f: impl FnOnce(&MemoryState) -> Result<R, MemoryEngineError>,
    ) -> Result<R, MemoryEngineError> {
        match txn {
            Some(id) => {
                let entry = self
                    .transactions
                    .get(&id.get())
                    .ok_or(MemoryEngineError::UnknownTransaction { id })?;
                f(&entry.state)
            }
            None => f(&self.committed.read()),
        }
    }

    async fn write<R, F>(&self, txn: Option<TransactionId>, f: F) -> Result<R, MemoryEngineError>
    where
        F: FnOnce(&mut MemoryState) -> Result<R, MemoryEngineError> + Send,
        R: Send,
    {
        if let Some(id) = txn {
            let mut entry = self
                .transactions
                .get_mut(&id.get())
                .ok_or(MemoryEngineError::UnknownTransaction { id })?;
            return f(&mut entry.state);
        }

        let _writer = self.writer.lock().await;
        let mut committed = self.committed.write();
        // Work on a copy so a failed statement leaves committed state untouched.
        let mut state = committed.clone();
        let result = f(&mut state)?;
        *committed = state;
        Ok(result)
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelationalEngine for MemoryEngine {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn sync(&self, model: &RelationalModel) -> anyhow::Result<()> {
        let _writer = self.writer.lock().await;
        let mut committed = self.committed.write();
        for table in model.creation_order() {
            if !committed.tables.contains_key(&table.name) {
                debug!(table = %table.name, "creating in-memory table");
                committed.tables.insert(table.name.clone(), MemoryTable::default());
            }
        }
        Ok(())
    }

    async fn begin(&self) -> anyhow::Result<TransactionId> {
        let writer = Arc::clone(&self.writer).lock_owned().await;
        let id = TransactionId::new(self.next_transaction.fetch_add(1, Ordering::Relaxed));
        let state = self.committed.read().clone();
        self.transactions.insert(
            id.get(),
            MemoryTransaction {
                state,
                _writer: writer,
            },
        );
        debug!(txn = %id, "began in-memory transaction");
        Ok(id)
    }

    async fn commit(&self, txn: TransactionId) -> anyhow::Result<()> {
        let (_, transaction) = self
            .transactions
            .remove(&txn.get())
            .ok_or(MemoryEngineError::UnknownTransaction { id: txn })?;
        *self.committed.write() = transaction.state;
        debug!(txn = %txn, "committed in-memory transaction");
        Ok(())
    }

    async fn rollback(&self, txn: TransactionId) -> anyhow::Result<()> {
        self.transactions
            .remove(&txn.get())
            .ok_or(MemoryEngineError::UnknownTransaction { id: txn })?;
        debug!(txn = %txn, "rolled back in-memory transaction");
        Ok(())
    }

    fn abandon(&self, txn: TransactionId) {
        if self.transactions.remove(&txn.get()).is_some() {
            debug!(txn = %txn, "abandoned in-memory transaction");
        }
    }

    async fn create(
        &self,
        table: &TableSpec,
        values: Object,
        txn: Option<TransactionId>,
    ) -> anyhow::Result<Object> {
        Ok(self.write(txn, |state| state.insert(table, values)).await?)
    }

    async fn find_all(
        &self,
        table: &TableSpec,
        filter: &Filter,
        order: &[OrderBy],
        limit: Option<u64>,
        txn: Option<TransactionId>,
    ) -> anyhow::Result<Vec<Object>> {
        Ok(self.read(txn, |state| state.select(table, filter, order, limit))?)
    }

    async fn update(
        &self,
        table: &TableSpec,
        values: Object,
        filter: &Filter,
        txn: Option<TransactionId>,
    ) -> anyhow::Result<u64> {
        Ok(self
            .write(txn, |state| state.update(table, &values, filter))
            .await?)
    }

    async fn destroy(
        &self,
        table: &TableSpec,
        filter: &Filter,
        txn: Option<TransactionId>,
    ) -> anyhow::Result<u64> {
        Ok(self.write(txn, |state| state.destroy(table, filter)).await?)
    }

    async fn count(
        &self,
        table: &TableSpec,
        filter: &Filter,
        txn: Option<TransactionId>,
    ) -> anyhow::Result<u64> {
        Ok(self.read(txn, |state| state.count(table, filter))?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use relstore_core::{
        ChildOf, CollectionDefinition, FieldDefinition, PrimitiveType, StorageRegistry,
    };
    use serde_json::json;

    use super::*;

    fn object(value: Value) -> Object {
        value.as_object().cloned().unwrap()
    }

    fn model() -> RelationalModel {
        let mut builder = StorageRegistry::new();
        builder
            .register_collection(
                CollectionDefinition::new("user")
                    .field("identifier", FieldDefinition::new(PrimitiveType::String))
                    .field("bio", FieldDefinition::optional(PrimitiveType::Text)),
            )
            .register_collection(
                CollectionDefinition::new("email")
                    .field("address", FieldDefinition::new(PrimitiveType::String))
                    .relationship(ChildOf::new("user")),
            );
        RelationalModel::build(&builder.finish()).unwrap()
    }

    async fn engine() -> (MemoryEngine, RelationalModel) {
        let engine = MemoryEngine::new();
        let model = model();
        engine.sync(&model).await.unwrap();
        (engine, model)
    }

    fn filter(query: Value) -> Filter {
        Filter::from_query(&object(query)).unwrap()
    }

    #[tokio::test]
    async fn create_assigns_sequential_ids_and_fills_nulls() {
        let (engine, model) = engine().await;
        let user = model.table("user").unwrap();

        let first = engine
            .create(user, object(json!({"identifier": "joe", "unknown": 1})), None)
            .await
            .unwrap();
        let second = engine
            .create(user, object(json!({"identifier": "bob"})), None)
            .await
            .unwrap();

        assert_eq!(Value::Object(first), json!({"id": 1, "identifier": "joe", "bio": null}));
        assert_eq!(second["id"], json!(2));
    }

    #[tokio::test]
    async fn not_null_violation_is_rejected() {
        let (engine, model) = engine().await;
        let err = engine
            .create(model.table("user").unwrap(), object(json!({"bio": "x"})), None)
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<MemoryEngineError>(),
            Some(&MemoryEngineError::NotNull {
                table: "user".to_string(),
                column: "identifier".to_string(),
            })
        );
        let count = engine
            .count(model.table("user").unwrap(), &Filter::default(), None)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn find_update_destroy_and_count() {
        let (engine, model) = engine().await;
        let user = model.table("user").unwrap();
        for name in ["c", "a", "b"] {
            engine
                .create(user, object(json!({"identifier": name})), None)
                .await
                .unwrap();
        }

        let rows = engine
            .find_all(user, &Filter::default(), &[OrderBy::asc("identifier")], Some(2), None)
            .await
            .unwrap();
        let names: Vec<&str> = rows.iter().map(|r| r["identifier"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["a", "b"]);

        let updated = engine
            .update(user, object(json!({"bio": "hi"})), &filter(json!({"id": {"$gte": 2}})), None)
            .await
            .unwrap();
        assert_eq!(updated, 2);

        let removed = engine
            .destroy(user, &filter(json!({"bio": "hi"})), None)
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(engine.count(user, &Filter::default(), None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_filter_column_is_an_error() {
        let (engine, model) = engine().await;
        let err = engine
            .count(model.table("user").unwrap(), &filter(json!({"nope": 1})), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MemoryEngineError>(),
            Some(MemoryEngineError::UnknownColumn { column, .. }) if column == "nope"
        ));
    }

    #[tokio::test]
    async fn transaction_is_invisible_until_commit() {
        let (engine, model) = engine().await;
        let user = model.table("user").unwrap();

        let txn = engine.begin().await.unwrap();
        engine
            .create(user, object(json!({"identifier": "joe"})), Some(txn))
            .await
            .unwrap();
        assert_eq!(engine.count(user, &Filter::default(), Some(txn)).await.unwrap(), 1);
        assert_eq!(engine.count(user, &Filter::default(), None).await.unwrap(), 0);

        engine.commit(txn).await.unwrap();
        assert_eq!(engine.count(user, &Filter::default(), None).await.unwrap(), 1);
        assert_eq!(engine.active_transactions(), 0);
    }

    #[tokio::test]
    async fn rollback_discards_snapshot() {
        let (engine, model) = engine().await;
        let user = model.table("user").unwrap();

        let txn = engine.begin().await.unwrap();
        engine
            .create(user, object(json!({"identifier": "joe"})), Some(txn))
            .await
            .unwrap();
        engine.rollback(txn).await.unwrap();

        assert_eq!(engine.count(user, &Filter::default(), None).await.unwrap(), 0);
        let err = engine.commit(txn).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<MemoryEngineError>(),
            Some(&MemoryEngineError::UnknownTransaction { id: txn })
        );
    }

    #[tokio::test]
    async fn standalone_writes_wait_for_active_transaction() {
        let (engine, model) = engine().await;
        let engine = Arc::new(engine);
        let user = model.table("user").unwrap().clone();

        let txn = engine.begin().await.unwrap();
        let writer = {
            let engine = Arc::clone(&engine);
            let user = user.clone();
            tokio::spawn(async move {
                engine
                    .create(&user, object(json!({"identifier": "late"})), None)
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        engine
            .create(&user, object(json!({"identifier": "first"})), Some(txn))
            .await
            .unwrap();
        engine.commit(txn).await.unwrap();

        let late = writer.await.unwrap();
        assert_eq!(late["id"], json!(2));
    }

    #[tokio::test]
    async fn explicit_keys_advance_the_counter_and_must_be_unique() {
        let (engine, model) = engine().await;
        let user = model.table("user").unwrap();
        engine
            .create(user, object(json!({"id": 10, "identifier": "a"})), None)
            .await
            .unwrap();
        let next = engine
            .create(user, object(json!({"identifier": "b"})), None)
            .await
            .unwrap();
        assert_eq!(next["id"], json!(11));

        let err = engine
            .create(user, object(json!({"id": 10, "identifier": "c"})), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MemoryEngineError>(),
            Some(MemoryEngineError::DuplicateKey { .. })
        ));
    }

    #[tokio::test]
    async fn abandoned_transaction_releases_the_writer() {
        let (engine, model) = engine().await;
        let user = model.table("user").unwrap();

        let txn = engine.begin().await.unwrap();
        engine
            .create(user, object(json!({"identifier": "lost"})), Some(txn))
            .await
            .unwrap();
        engine.abandon(txn);
        engine.abandon(txn);
        assert_eq!(engine.active_transactions(), 0);

        let row = tokio::time::timeout(
            Duration::from_secs(1),
            engine.create(user, object(json!({"identifier": "next"})), None),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(row["identifier"], json!("next"));
        assert_eq!(engine.count(user, &Filter::default(), None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn every_auto_increment_column_has_its_own_counter() {
        let mut builder = StorageRegistry::new();
        builder.register_collection(
            CollectionDefinition::new("ticket")
                .field("serial", FieldDefinition::new(PrimitiveType::AutoPk)),
        );
        let model = RelationalModel::build(&builder.finish()).unwrap();
        let engine = MemoryEngine::new();
        engine.sync(&model).await.unwrap();
        let ticket = model.table("ticket").unwrap();

        engine
            .create(ticket, object(json!({"serial": 100})), None)
            .await
            .unwrap();
        let second = engine.create(ticket, Object::new(), None).await.unwrap();
        assert_eq!(Value::Object(second), json!({"id": 2, "serial": 101}));
    }
}
