//! Storage abstraction for idempotency records.
//!
//! Stores only need per-key conditional writes; all mutual exclusion between
//! concurrent invocations comes from [`PersistenceStore::put_in_progress`]
//! accepting or rejecting a write.

pub mod memory_store;
pub mod postgres_store;
pub mod redis_store;

pub use memory_store::InMemoryPersistenceStore;
pub use postgres_store::PostgresPersistenceStore;
pub use redis_store::RedisPersistenceStore;

use crate::config::{PersistenceBackend, Settings};
use crate::error::PersistenceError;
use crate::idempotency::record::IdempotencyRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;

/// Precondition attached to an in-progress write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCondition {
    /// Accept when the key is absent or its record is expired at `now`.
    NoLiveRecord { now: DateTime<Utc> },
    /// Accept only when the stored record still carries exactly these
    /// expiry values, i.e. nobody else has taken it over since it was read.
    Takeover {
        expiry_timestamp: i64,
        in_progress_expiry_timestamp: Option<i64>,
    },
}

impl WriteCondition {
    pub fn takeover_of(record: &IdempotencyRecord) -> Self {
        WriteCondition::Takeover {
            expiry_timestamp: record.expiry_timestamp,
            in_progress_expiry_timestamp: record.in_progress_expiry_timestamp,
        }
    }

    /// Evaluates the condition against the currently stored record.
    pub fn admits(&self, existing: Option<&IdempotencyRecord>) -> bool {
        match (self, existing) {
            (WriteCondition::NoLiveRecord { .. }, None) => true,
            (WriteCondition::NoLiveRecord { now }, Some(record)) => record.is_reclaimable(*now),
            (WriteCondition::Takeover { .. }, None) => false,
            (
                WriteCondition::Takeover {
                    expiry_timestamp,
                    in_progress_expiry_timestamp,
                },
                Some(record),
            ) => {
                record.expiry_timestamp == *expiry_timestamp
                    && record.in_progress_expiry_timestamp == *in_progress_expiry_timestamp
            }
        }
    }
}

/// Persistence capability consumed by the idempotency handler.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Writes an in-progress record if `condition` holds, replacing any
    /// record it admits. Fails with `ConditionalCheckFailed` otherwise.
    async fn put_in_progress(
        &self,
        record: &IdempotencyRecord,
        condition: &WriteCondition,
    ) -> Result<(), PersistenceError>;

    /// Marks a record complete. Fails with `RecordNotFound` if it vanished.
    async fn update_complete(
        &self,
        idempotency_key: &str,
        response_data: &Value,
        expiry_timestamp: i64,
    ) -> Result<(), PersistenceError>;

    async fn get(&self, idempotency_key: &str) -> Result<Option<IdempotencyRecord>, PersistenceError>;

    /// Removes a record. Deleting an absent key is not an error.
    async fn delete(&self, idempotency_key: &str) -> Result<(), PersistenceError>;

    /// Removes records whose expiry has passed, for stores without native
    /// item expiry. Returns the number of removed records.
    async fn purge_expired(&self, _now: DateTime<Utc>) -> Result<u64, PersistenceError> {
        Ok(0)
    }
}

/// How an idempotency key maps onto a store's primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyLayout {
    /// The idempotency key is the whole primary key.
    Single,
    /// A static partition key shared by one deployment, with the idempotency
    /// key as sort key. Lets several functions share one table.
    Composite { partition_key: String },
}

impl KeyLayout {
    pub fn from_settings(settings: &Settings) -> Self {
        if settings.persistence.sort_key_enabled {
            KeyLayout::Composite {
                partition_key: settings.static_partition_key(),
            }
        } else {
            KeyLayout::Single
        }
    }

    /// Returns `(partition key, sort key)`; the sort key is empty for `Single`.
    pub fn split<'a>(&'a self, idempotency_key: &'a str) -> (&'a str, &'a str) {
        match self {
            KeyLayout::Single => (idempotency_key, ""),
            KeyLayout::Composite { partition_key } => (partition_key, idempotency_key),
        }
    }
}

/// Builds the store selected in `settings`.
pub async fn connect(settings: &Settings) -> Result<Arc<dyn PersistenceStore>, PersistenceError> {
    let layout = KeyLayout::from_settings(settings);
    let url = || {
        settings.persistence.url.clone().ok_or_else(|| {
            PersistenceError::Connection("persistence.url is required for this backend".to_string())
        })
    };

    let store: Arc<dyn PersistenceStore> = match settings.persistence.backend {
        PersistenceBackend::Memory => Arc::new(InMemoryPersistenceStore::new()),
        PersistenceBackend::Postgres => {
            let store = PostgresPersistenceStore::connect(
                &url()?,
                settings.persistence.pool_size,
                &settings.persistence.table_name,
                layout,
            )
            .await?;
            store.ensure_schema().await?;
            Arc::new(store)
        }
        PersistenceBackend::Redis => Arc::new(RedisPersistenceStore::open(&url()?, layout)?),
    };

    Ok(store)
}
