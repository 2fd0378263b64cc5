#![allow(dead_code)]

use chrono::{DateTime, Utc};
use lambda_idempotency::clock::ManualClock;
use lambda_idempotency::config::IdempotencyConfig;
use lambda_idempotency::error::IdempotencyError;
use lambda_idempotency::idempotency::IdempotencyHandler;
use lambda_idempotency::persistence::InMemoryPersistenceStore;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const SCOPE: &str = "test-func.handler";

pub fn start_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-01-18T12:00:00Z")
        .expect("valid timestamp")
        .with_timezone(&Utc)
}

/// Error type returned by the operations under test.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("operation failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),
}

impl OperationError {
    pub fn idempotency(&self) -> Option<&IdempotencyError> {
        match self {
            OperationError::Idempotency(e) => Some(e),
            OperationError::Failed(_) => None,
        }
    }
}

/// Handler wired to an in-memory store and a manual clock.
pub struct Harness {
    pub handler: Arc<IdempotencyHandler>,
    pub store: Arc<InMemoryPersistenceStore>,
    pub clock: Arc<ManualClock>,
}

pub fn harness(config: IdempotencyConfig) -> Harness {
    let store = Arc::new(InMemoryPersistenceStore::new());
    let clock = Arc::new(ManualClock::new(start_time()));

    let handler = IdempotencyHandler::new(store.clone(), SCOPE, config)
        .expect("valid config")
        .with_clock(clock.clone());

    Harness {
        handler: Arc::new(handler),
        store,
        clock,
    }
}

/// Counts producer invocations.
#[derive(Debug, Default, Clone)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hit(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}
