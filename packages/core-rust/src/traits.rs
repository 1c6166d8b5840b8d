use crate::batch::{CreateObjectDissection, OperationBatch};
use crate::registry::Registry;
use crate::types::Object;

/// Flattens one nested create request into primitive operations.
///
/// The returned batch must list every create before any operation that
/// references its placeholder, and each dissection step must point at an
/// object that exists in `args`.
pub trait Dissector: Send + Sync {
    /// Splits `args` (a request against `collection`) into a batch plus the
    /// plan for writing generated keys back into the request.
    fn dissect(
        &self,
        registry: &Registry,
        collection: &str,
        args: &Object,
    ) -> anyhow::Result<(OperationBatch, CreateObjectDissection)>;
}
