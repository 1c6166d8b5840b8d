//! Relational engine abstraction.
//!
//! A [`RelationalEngine`] owns the physical tables of one named database.
//! The backend talks to it in physical terms only: rows already carry
//! foreign-key column names and storage-encoded values.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use relstore_core::{Filter, Object, OrderBy, RelationalModel, TableSpec, TransactionId};

pub use memory::MemoryEngine;
#[cfg(feature = "postgres")]
pub use postgres::PostgresEngine;

/// Row-level access to one relational database.
///
/// Every data method takes an optional transaction. `None` runs the
/// statement on its own, `Some` runs it inside a transaction previously
/// returned by [`begin`](Self::begin).
///
/// Wrapped in `Arc<dyn RelationalEngine>` and shared across tasks.
#[async_trait]
pub trait RelationalEngine: Send + Sync + 'static {
    /// Short engine name for logs.
    fn name(&self) -> &'static str;

    /// Creates every table of `model` that does not exist yet.
    async fn sync(&self, model: &RelationalModel) -> anyhow::Result<()>;

    async fn begin(&self) -> anyhow::Result<TransactionId>;

    async fn commit(&self, txn: TransactionId) -> anyhow::Result<()>;

    async fn rollback(&self, txn: TransactionId) -> anyhow::Result<()>;

    /// Drops a transaction whose owner went away without committing or
    /// rolling back. Must not block; unknown ids are ignored.
    fn abandon(&self, txn: TransactionId);

    /// Inserts one row and returns it as stored, generated key included.
    async fn create(
        &self,
        table: &TableSpec,
        values: Object,
        txn: Option<TransactionId>,
    ) -> anyhow::Result<Object>;

    async fn find_all(
        &self,
        table: &TableSpec,
        filter: &Filter,
        order: &[OrderBy],
        limit: Option<u64>,
        txn: Option<TransactionId>,
    ) -> anyhow::Result<Vec<Object>>;

    /// Applies `values` to every matching row. Returns the affected count.
    async fn update(
        &self,
        table: &TableSpec,
        values: Object,
        filter: &Filter,
        txn: Option<TransactionId>,
    ) -> anyhow::Result<u64>;

    /// Deletes every matching row. Returns the affected count.
    async fn destroy(
        &self,
        table: &TableSpec,
        filter: &Filter,
        txn: Option<TransactionId>,
    ) -> anyhow::Result<u64>;

    async fn count(
        &self,
        table: &TableSpec,
        filter: &Filter,
        txn: Option<TransactionId>,
    ) -> anyhow::Result<u64>;
}
