use crate::error::PersistenceError;
use crate::idempotency::record::{IdempotencyRecord, IdempotencyStatus};
use crate::persistence::{PersistenceStore, WriteCondition};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Process-local store. Each operation runs under one lock, which makes
/// every conditional write an atomic compare-and-swap.
#[derive(Debug, Default)]
pub struct InMemoryPersistenceStore {
    records: Mutex<HashMap<String, IdempotencyRecord>>,
}

impl InMemoryPersistenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, IdempotencyRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Writes a record unconditionally.
    pub fn insert(&self, record: IdempotencyRecord) {
        self.records()
            .insert(record.idempotency_key.clone(), record);
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }
}

#[async_trait]
impl PersistenceStore for InMemoryPersistenceStore {
    async fn put_in_progress(
        &self,
        record: &IdempotencyRecord,
        condition: &WriteCondition,
    ) -> Result<(), PersistenceError> {
        let mut records = self.records();

        if !condition.admits(records.get(&record.idempotency_key)) {
            return Err(PersistenceError::ConditionalCheckFailed {
                key: record.idempotency_key.clone(),
            });
        }

        records.insert(record.idempotency_key.clone(), record.clone());
        Ok(())
    }

    async fn update_complete(
        &self,
        idempotency_key: &str,
        response_data: &Value,
        expiry_timestamp: i64,
    ) -> Result<(), PersistenceError> {
        let mut records = self.records();
        let record = records
            .get_mut(idempotency_key)
            .ok_or_else(|| PersistenceError::RecordNotFound {
                key: idempotency_key.to_string(),
            })?;

        record.status = IdempotencyStatus::Completed;
        record.response_data = Some(response_data.clone());
        record.expiry_timestamp = expiry_timestamp;
        Ok(())
    }

    async fn get(&self, idempotency_key: &str) -> Result<Option<IdempotencyRecord>, PersistenceError> {
        Ok(self.records().get(idempotency_key).cloned())
    }

    async fn delete(&self, idempotency_key: &str) -> Result<(), PersistenceError> {
        self.records().remove(idempotency_key);
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, PersistenceError> {
        let mut records = self.records();
        let before = records.len();
        records.retain(|_, record| !record.is_expired(now));
        Ok((before - records.len()) as u64)
    }
}
