//! Object-graph batch execution.

use std::time::Instant;

use relstore_core::{BatchExecutionResult, BatchOperation, PlaceholderTable, TransactionContext};
use tracing::{debug, info_span, Instrument};

use super::{SqlStorageBackend, UpdateOptions};
use crate::error::StorageError;

impl SqlStorageBackend {
    /// Executes `batch` in order under `ctx`.
    ///
    /// Creates are raw inserts: their `replace` entries are resolved from
    /// earlier creates of the same batch and the result is never dissected
    /// again. The caller owns the transaction, so a failure here leaves the
    /// rollback to it.
    pub(super) async fn run_batch(
        &self,
        batch: &[BatchOperation],
        ctx: &TransactionContext,
    ) -> Result<BatchExecutionResult, StorageError> {
        let span = info_span!(
            "batch",
            txn = %ctx.id,
            database = %ctx.database,
            operations = batch.len(),
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        async move {
            let start = Instant::now();
            let result = self.run_batch_operations(batch, ctx).await;

            #[allow(clippy::cast_possible_truncation)]
            let duration_ms = start.elapsed().as_millis() as u64;
            let outcome = if result.is_ok() { "ok" } else { "error" };
            tracing::Span::current().record("duration_ms", duration_ms);
            tracing::Span::current().record("outcome", outcome);
            debug!(duration_ms, outcome, "batch complete");

            result
        }
        .instrument(span)
        .await
    }

    async fn run_batch_operations(
        &self,
        batch: &[BatchOperation],
        ctx: &TransactionContext,
    ) -> Result<BatchExecutionResult, StorageError> {
        let state = self.state()?;
        let mut placeholders = PlaceholderTable::new();

        for operation in batch {
            match operation {
                BatchOperation::CreateObject(create) => {
                    let (definition, _) = state.collection(&create.collection)?;
                    let mut args = create.args.clone();
                    placeholders.apply_replacements(&mut args, &create.replace)?;
                    let object = self
                        .raw_create(&state, &create.collection, args, ctx)
                        .await?;
                    let resolved = placeholders.register(
                        create.placeholder.clone(),
                        &create.collection,
                        &definition.pk_index,
                        object,
                    )?;
                    debug!(
                        collection = %create.collection,
                        placeholder = %create.placeholder,
                        primary_key = %resolved.primary_key,
                        "batch object created"
                    );
                }
                BatchOperation::UpdateObjects(update) => {
                    let affected = self
                        .update_in(
                            &update.collection,
                            &update.where_,
                            update.updates.clone(),
                            &UpdateOptions::default(),
                            Some(ctx),
                        )
                        .await?;
                    debug!(collection = %update.collection, affected, "batch update applied");
                }
            }
        }

        Ok(placeholders.into_result())
    }
}
