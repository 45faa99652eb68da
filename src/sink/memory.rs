//! In-process sink with failure injection, for tests and dry runs
use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use async_trait::async_trait;

use super::{RecordSink, WriteError};
use crate::{bootstrap::BootstrapError, record::UserRecord};

#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<String, UserRecord>>,
    failures: Mutex<VecDeque<WriteError>>,
    attempts: Mutex<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next upsert calls fail with the given errors, in order.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = WriteError>) {
        lock(&self.failures).extend(errors);
    }

    /// Upsert calls seen so far, failed ones included.
    pub fn attempts(&self) -> u64 {
        *lock(&self.attempts)
    }

    pub fn rows(&self) -> HashMap<String, UserRecord> {
        lock(&self.rows).clone()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl RecordSink for MemoryStore {
    async fn ensure_schema(&self) -> Result<(), BootstrapError> {
        Ok(())
    }

    async fn upsert(&self, record: &UserRecord) -> Result<(), WriteError> {
        *lock(&self.attempts) += 1;
        if let Some(err) = lock(&self.failures).pop_front() {
            return Err(err);
        }
        lock(&self.rows).insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<UserRecord>, WriteError> {
        Ok(lock(&self.rows).get(id).cloned())
    }

    async fn count(&self) -> Result<u64, WriteError> {
        Ok(lock(&self.rows).len() as u64)
    }
}
