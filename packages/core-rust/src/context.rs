use std::fmt;

/// Engine-assigned identifier of an open relational transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(u64);

impl TransactionId {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Marker carried by every operation that runs inside an active transaction.
/// Threaded explicitly through all backend calls so that nested operations
/// reuse the caller's transaction instead of opening another one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionContext {
    /// Transaction handle issued by the relational engine.
    pub id: TransactionId,
    /// Named database the transaction was opened on.
    pub database: String,
}

impl TransactionContext {
    #[must_use]
    pub fn new(id: TransactionId, database: impl Into<String>) -> Self {
        Self {
            id,
            database: database.into(),
        }
    }
}
