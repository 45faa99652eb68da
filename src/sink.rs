//! Idempotent record sinks
pub mod clickhouse;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::{bootstrap::BootstrapError, record::UserRecord};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    /// Connection loss, timeout; the same write may succeed later.
    #[error("transient write failure: {0}")]
    Transient(String),
    /// The store refused the row; retrying cannot help.
    #[error("permanent write failure: {0}")]
    Permanent(String),
}

/// Upsert-by-`id` store for user records.
///
/// An upsert replaces the whole row for its `id`, so writing the same record
/// twice leaves the store as if it had been written once.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Creates namespace and table if absent. Safe to call from every instance.
    async fn ensure_schema(&self) -> Result<(), BootstrapError>;

    async fn upsert(&self, record: &UserRecord) -> Result<(), WriteError>;

    /// Current row for `id`, if any.
    async fn get(&self, id: &str) -> Result<Option<UserRecord>, WriteError>;

    /// Number of distinct keys stored.
    async fn count(&self) -> Result<u64, WriteError>;
}
