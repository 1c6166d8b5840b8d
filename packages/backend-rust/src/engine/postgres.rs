//! Postgres [`RelationalEngine`] on `sqlx`.
//!
//! Rows travel as JSON in both directions: inserts and updates bind one
//! `jsonb` object and expand it with `jsonb_populate_record`, reads return
//! `to_jsonb(t.*)`. Table and column names come from the relational model,
//! whose identifiers are validated when the model is built.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use relstore_core::{
    ColumnSpec, ColumnType, CompareOp, Direction, Filter, Object, OrderBy, RelationalModel,
    TableSpec, TransactionId, Value,
};
use sqlx::postgres::{PgPool, PgPoolOptions, Postgres};
use sqlx::types::Json;
use sqlx::Transaction;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::RelationalEngine;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PostgresEngineError {
    #[error("column {table}.{column} does not exist")]
    UnknownColumn { table: String, column: String },

    #[error("transaction {id} is not active")]
    UnknownTransaction { id: TransactionId },
}

/// SQL text plus its positional `jsonb` parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    fn new(sql: String) -> Self {
        Self {
            sql,
            params: Vec::new(),
        }
    }

    /// Appends a parameter and returns its placeholder (`$n`).
    fn param(&mut self, value: Value) -> String {
        self.params.push(value);
        format!("${}", self.params.len())
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{identifier}\"")
}

fn column_sql_type(column: &ColumnSpec) -> &'static str {
    match column.column_type {
        ColumnType::Integer if column.auto_increment => "SERIAL",
        ColumnType::Integer => "INTEGER",
        ColumnType::Text => "TEXT",
        ColumnType::Json => "JSONB",
        ColumnType::Date => "TIMESTAMPTZ",
        ColumnType::Float => "DOUBLE PRECISION",
        ColumnType::String => "VARCHAR(255)",
        ColumnType::Boolean => "BOOLEAN",
    }
}

/// `CREATE TABLE IF NOT EXISTS` for one table.
#[must_use]
pub fn create_table_sql(table: &TableSpec) -> String {
    let columns: Vec<String> = table
        .columns
        .iter()
        .map(|column| {
            let mut def = format!("{} {}", quote(&column.name), column_sql_type(column));
            if column.primary_key {
                def.push_str(" PRIMARY KEY");
            } else if !column.nullable {
                def.push_str(" NOT NULL");
            }
            if let Some(reference) = &column.references {
                let _ = write!(
                    def,
                    " REFERENCES {} ({})",
                    quote(&reference.table),
                    quote(&reference.column)
                );
            }
            def
        })
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote(&table.name),
        columns.join(", ")
    )
}

fn where_clause(
    table: &TableSpec,
    filter: &Filter,
    statement: &mut Statement,
) -> Result<String, PostgresEngineError> {
    if filter.is_empty() {
        return Ok(String::new());
    }
    let mut parts = Vec::with_capacity(filter.conditions.len());
    for condition in &filter.conditions {
        known_column(table, &condition.field)?;
        let lhs = format!("(to_jsonb(t.*) -> '{}')", condition.field);
        let placeholder = statement.param(condition.value.clone());
        let part = match condition.op {
            CompareOp::In => format!("{lhs} IN (SELECT jsonb_array_elements({placeholder}))"),
            op => format!("{lhs} {} {placeholder}", op.sql()),
        };
        parts.push(part);
    }
    Ok(format!(" WHERE {}", parts.join(" AND ")))
}

fn known_column(table: &TableSpec, column: &str) -> Result<(), PostgresEngineError> {
    if table.has_column(column) {
        Ok(())
    } else {
        Err(PostgresEngineError::UnknownColumn {
            table: table.name.clone(),
            column: column.to_string(),
        })
    }
}

/// Values restricted to the table's columns. A null auto-increment key is
/// dropped so the sequence assigns one.
fn writable_values(table: &TableSpec, values: Object) -> Object {
    values
        .into_iter()
        .filter(|(name, value)| match table.column(name) {
            Some(column) => !(column.auto_increment && value.is_null()),
            None => false,
        })
        .collect()
}

#[must_use]
pub fn insert_statement(table: &TableSpec, values: Object) -> Statement {
    let values = writable_values(table, values);
    let name = quote(&table.name);
    if values.is_empty() {
        return Statement::new(format!(
            "INSERT INTO {name} AS t DEFAULT VALUES RETURNING to_jsonb(t.*)"
        ));
    }
    let columns: Vec<String> = values.keys().map(|c| quote(c)).collect();
    let selected: Vec<String> = values.keys().map(|c| format!("r.{}", quote(c))).collect();
    let mut statement = Statement::new(String::new());
    let placeholder = statement.param(Value::Object(values));
    statement.sql = format!(
        "INSERT INTO {name} AS t ({}) SELECT {} FROM jsonb_populate_record(NULL::{name}, {placeholder}) AS r RETURNING to_jsonb(t.*)",
        columns.join(", "),
        selected.join(", "),
    );
    statement
}

/// # Errors
///
/// Fails when the filter or ordering names a column the table lacks.
pub fn select_statement(
    table: &TableSpec,
    filter: &Filter,
    order: &[OrderBy],
    limit: Option<u64>,
) -> Result<Statement, PostgresEngineError> {
    let mut statement = Statement::new(String::new());
    let mut sql = format!("SELECT to_jsonb(t.*) FROM {} AS t", quote(&table.name));
    sql.push_str(&where_clause(table, filter, &mut statement)?);
    if !order.is_empty() {
        let mut keys = Vec::with_capacity(order.len());
        for key in order {
            known_column(table, &key.field)?;
            let direction = match key.direction {
                Direction::Asc => "ASC NULLS FIRST",
                Direction::Desc => "DESC NULLS LAST",
            };
            keys.push(format!("t.{} {direction}", quote(&key.field)));
        }
        let _ = write!(sql, " ORDER BY {}", keys.join(", "));
    }
    if let Some(limit) = limit {
        let _ = write!(sql, " LIMIT {limit}");
    }
    statement.sql = sql;
    Ok(statement)
}

/// Returns `None` when none of `values` maps to a column.
///
/// # Errors
///
/// Fails when the filter names a column the table lacks.
pub fn update_statement(
    table: &TableSpec,
    values: Object,
    filter: &Filter,
) -> Result<Option<Statement>, PostgresEngineError> {
    let values = writable_values(table, values);
    if values.is_empty() {
        return Ok(None);
    }
    let assignments: Vec<String> = values
        .keys()
        .map(|c| format!("{} = r.{}", quote(c), quote(c)))
        .collect();
    let name = quote(&table.name);
    let mut statement = Statement::new(String::new());
    let placeholder = statement.param(Value::Object(values));
    let mut sql = format!(
        "UPDATE {name} AS t SET {} FROM jsonb_populate_record(NULL::{name}, {placeholder}) AS r",
        assignments.join(", "),
    );
    sql.push_str(&where_clause(table, filter, &mut statement)?);
    statement.sql = sql;
    Ok(Some(statement))
}

/// # Errors
///
/// Fails when the filter names a column the table lacks.
pub fn delete_statement(table: &TableSpec, filter: &Filter) -> Result<Statement, PostgresEngineError> {
    let mut statement = Statement::new(String::new());
    let mut sql = format!("DELETE FROM {} AS t", quote(&table.name));
    sql.push_str(&where_clause(table, filter, &mut statement)?);
    statement.sql = sql;
    Ok(statement)
}

/// # Errors
///
/// Fails when the filter names a column the table lacks.
pub fn count_statement(table: &TableSpec, filter: &Filter) -> Result<Statement, PostgresEngineError> {
    let mut statement = Statement::new(String::new());
    let mut sql = format!("SELECT COUNT(*) FROM {} AS t", quote(&table.name));
    sql.push_str(&where_clause(table, filter, &mut statement)?);
    statement.sql = sql;
    Ok(statement)
}

type TransactionHandle = Arc<Mutex<Option<Transaction<'static, Postgres>>>>;

/// Relational engine backed by a Postgres connection pool.
pub struct PostgresEngine {
    pool: PgPool,
    transactions: DashMap<u64, TransactionHandle>,
    next_transaction: AtomicU64,
    log_statements: bool,
}

impl PostgresEngine {
    #[must_use]
    pub fn new(pool: PgPool, log_statements: bool) -> Self {
        Self {
            pool,
            transactions: DashMap::new(),
            next_transaction: AtomicU64::new(1),
            log_statements,
        }
    }

    /// Opens a pool against `url`.
    ///
    /// # Errors
    ///
    /// Fails if the initial connection cannot be established.
    pub async fn connect(url: &str, max_connections: u32, log_statements: bool) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self::new(pool, log_statements))
    }

    fn handle(&self, id: TransactionId) -> Result<TransactionHandle, PostgresEngineError> {
        self.transactions
            .get(&id.get())
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(PostgresEngineError::UnknownTransaction { id })
    }

    fn trace(&self, statement: &Statement) {
        if self.log_statements {
            debug!(sql = %statement.sql, params = statement.params.len(), "executing statement");
        }
    }

    async fn fetch_rows(
        &self,
        statement: &Statement,
        txn: Option<TransactionId>,
    ) -> anyhow::Result<Vec<Object>> {
        self.trace(statement);
        let mut query = sqlx::query_scalar::<_, Json<Value>>(&statement.sql);
        for param in &statement.params {
            query = query.bind(Json(param.clone()));
        }
        let rows = match txn {
            Some(id) => {
                let handle = self.handle(id)?;
                let mut guard = handle.lock().await;
                let tx = guard
                    .as_mut()
                    .ok_or(PostgresEngineError::UnknownTransaction { id })?;
                query.fetch_all(&mut **tx).await?
            }
            None => query.fetch_all(&self.pool).await?,
        };
        Ok(rows
            .into_iter()
            .filter_map(|Json(row)| match row {
                Value::Object(object) => Some(object),
                _ => None,
            })
            .collect())
    }

    async fn fetch_count(&self, statement: &Statement, txn: Option<TransactionId>) -> anyhow::Result<u64> {
        self.trace(statement);
        let mut query = sqlx::query_scalar::<_, i64>(&statement.sql);
        for param in &statement.params {
            query = query.bind(Json(param.clone()));
        }
        let count = match txn {
            Some(id) => {
                let handle = self.handle(id)?;
                let mut guard = handle.lock().await;
                let tx = guard
                    .as_mut()
                    .ok_or(PostgresEngineError::UnknownTransaction { id })?;
                query.fetch_one(&mut **tx).await?
            }
            None => query.fetch_one(&self.pool).await?,
        };
        Ok(u64::try_from(count)?)
    }

    async fn execute(&self, statement: &Statement, txn: Option<TransactionId>) -> anyhow::Result<u64> {
        self.trace(statement);
        let mut query = sqlx::query(&statement.sql);
        for param in &statement.params {
            query = query.bind(Json(param.clone()));
        }
        let result = match txn {
            Some(id) => {
                let handle = self.handle(id)?;
                let mut guard = handle.lock().await;
                let tx = guard
                    .as_mut()
                    .ok_or(PostgresEngineError::UnknownTransaction { id })?;
                query.execute(&mut **tx).await?
            }
            None => query.execute(&self.pool).await?,
        };
        Ok(result.rows_affected())
    }

    async fn finish(&self, id: TransactionId, commit: bool) -> anyhow::Result<()> {
        let (_, handle) = self
            .transactions
            .remove(&id.get())
            .ok_or(PostgresEngineError::UnknownTransaction { id })?;
        let tx = handle
            .lock()
            .await
            .take()
            .ok_or(PostgresEngineError::UnknownTransaction { id })?;
        if commit {
            tx.commit().await?;
        } else {
            tx.rollback().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl RelationalEngine for PostgresEngine {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn sync(&self, model: &RelationalModel) -> anyhow::Result<()> {
        for table in model.creation_order() {
            let statement = Statement::new(create_table_sql(table));
            self.execute(&statement, None).await?;
            info!(table = %table.name, "ensured table");
        }
        Ok(())
    }

    async fn begin(&self) -> anyhow::Result<TransactionId> {
        let tx = self.pool.begin().await?;
        let id = TransactionId::new(self.next_transaction.fetch_add(1, Ordering::Relaxed));
        self.transactions.insert(id.get(), Arc::new(Mutex::new(Some(tx))));
        Ok(id)
    }

    async fn commit(&self, txn: TransactionId) -> anyhow::Result<()> {
        self.finish(txn, true).await
    }

    async fn rollback(&self, txn: TransactionId) -> anyhow::Result<()> {
        self.finish(txn, false).await
    }

    fn abandon(&self, txn: TransactionId) {
        // sqlx rolls back a dropped transaction when its connection returns to the pool.
        if self.transactions.remove(&txn.get()).is_some() {
            debug!(txn = %txn, "abandoned postgres transaction");
        }
    }

    async fn create(
        &self,
        table: &TableSpec,
        values: Object,
        txn: Option<TransactionId>,
    ) -> anyhow::Result<Object> {
        let statement = insert_statement(table, values);
        self.fetch_rows(&statement, txn)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("insert into {} returned no row", table.name))
    }

    async fn find_all(
        &self,
        table: &TableSpec,
        filter: &Filter,
        order: &[OrderBy],
        limit: Option<u64>,
        txn: Option<TransactionId>,
    ) -> anyhow::Result<Vec<Object>> {
        let statement = select_statement(table, filter, order, limit)?;
        self.fetch_rows(&statement, txn).await
    }

    async fn update(
        &self,
        table: &TableSpec,
        values: Object,
        filter: &Filter,
        txn: Option<TransactionId>,
    ) -> anyhow::Result<u64> {
        match update_statement(table, values, filter)? {
            Some(statement) => self.execute(&statement, txn).await,
            None => Ok(0),
        }
    }

    async fn destroy(
        &self,
        table: &TableSpec,
        filter: &Filter,
        txn: Option<TransactionId>,
    ) -> anyhow::Result<u64> {
        let statement = delete_statement(table, filter)?;
        self.execute(&statement, txn).await
    }

    async fn count(
        &self,
        table: &TableSpec,
        filter: &Filter,
        txn: Option<TransactionId>,
    ) -> anyhow::Result<u64> {
        let statement = count_statement(table, filter)?;
        self.fetch_count(&statement, txn).await
    }
}
