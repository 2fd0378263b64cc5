use crate::cache::{CacheStats, LocalCache};
use crate::clock::{Clock, SystemClock};
use crate::config::IdempotencyConfig;
use crate::error::{IdempotencyError, PersistenceError, Result};
use crate::idempotency::key_generator::{DerivedKey, IdempotencyKeyGenerator};
use crate::idempotency::record::{IdempotencyRecord, IdempotencyStatus};
use crate::observability::{get_metrics, LatencyTimer, Outcome};
use crate::persistence::{PersistenceStore, WriteCondition};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A fresh claim plus one takeover of a stale record.
const MAX_CLAIM_ATTEMPTS: usize = 2;

/// Metrics for idempotency handling.
#[derive(Debug, Default)]
pub struct IdempotencyMetrics {
    pub total_requests: AtomicU64,
    pub bypassed_requests: AtomicU64,
    pub executed_requests: AtomicU64,
    pub replayed_requests: AtomicU64,
    pub in_progress_rejections: AtomicU64,
    pub validation_failures: AtomicU64,
    pub producer_failures: AtomicU64,
    pub serialization_failures: AtomicU64,
    pub persistence_failures: AtomicU64,
}

impl IdempotencyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, outcome: Outcome) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            Outcome::Bypassed => &self.bypassed_requests,
            Outcome::Executed => &self.executed_requests,
            Outcome::Replayed | Outcome::CacheReplayed => &self.replayed_requests,
            Outcome::InProgress => &self.in_progress_rejections,
            Outcome::ValidationFailed => &self.validation_failures,
            Outcome::ProducerFailed => &self.producer_failures,
            Outcome::SerializationFailed => &self.serialization_failures,
            Outcome::PersistenceFailed => &self.persistence_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            bypassed_requests: self.bypassed_requests.load(Ordering::Relaxed),
            executed_requests: self.executed_requests.load(Ordering::Relaxed),
            replayed_requests: self.replayed_requests.load(Ordering::Relaxed),
            in_progress_rejections: self.in_progress_rejections.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            producer_failures: self.producer_failures.load(Ordering::Relaxed),
            serialization_failures: self.serialization_failures.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub bypassed_requests: u64,
    pub executed_requests: u64,
    pub replayed_requests: u64,
    pub in_progress_rejections: u64,
    pub validation_failures: u64,
    pub producer_failures: u64,
    pub serialization_failures: u64,
    pub persistence_failures: u64,
}

impl MetricsSnapshot {
    pub fn replay_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.replayed_requests as f64 / self.total_requests as f64
        }
    }
}

/// Facts about the current invocation supplied by the runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct InvocationContext {
    remaining_time: Option<Duration>,
}

impl InvocationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps how long an in-progress record blocks other callers.
    pub fn with_remaining_time(mut self, remaining: Duration) -> Self {
        self.remaining_time = Some(remaining);
        self
    }

    pub fn with_remaining_time_millis(self, millis: u64) -> Self {
        self.with_remaining_time(Duration::from_millis(millis))
    }

    pub fn remaining_time(&self) -> Option<Duration> {
        self.remaining_time
    }
}

/// Rewrites a stored response before it is replayed.
pub type ResponseHook = Arc<dyn Fn(Value, &IdempotencyRecord) -> Value + Send + Sync>;

enum Claim {
    Acquired,
    Replay(IdempotencyRecord),
}

/// Runs operations at most once per idempotency key.
///
/// The only point of mutual exclusion is the store's conditional
/// in-progress write. Everything read afterwards is advisory and only
/// decides whether to replay, reject, or try one takeover.
pub struct IdempotencyHandler {
    store: Arc<dyn PersistenceStore>,
    key_generator: IdempotencyKeyGenerator,
    cache: Option<LocalCache>,
    clock: Arc<dyn Clock>,
    metrics: Arc<IdempotencyMetrics>,
    config: IdempotencyConfig,
    response_hook: Option<ResponseHook>,
}

impl IdempotencyHandler {
    /// Builds a handler whose keys are namespaced by `scope`
    /// (usually `<function name>.<operation>`).
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        scope: impl Into<String>,
        config: IdempotencyConfig,
    ) -> Result<Self> {
        config.check()?;
        let key_generator = IdempotencyKeyGenerator::new(scope, &config)?;

        let cache = if config.use_local_cache {
            let max_items = NonZeroUsize::new(config.local_cache_max_items).ok_or_else(|| {
                IdempotencyError::InvalidConfig("local_cache_max_items must be positive".to_string())
            })?;
            Some(LocalCache::new(max_items))
        } else {
            None
        };

        Ok(Self {
            store,
            key_generator,
            cache,
            clock: Arc::new(SystemClock),
            metrics: Arc::new(IdempotencyMetrics::new()),
            config,
            response_hook: None,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_response_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(Value, &IdempotencyRecord) -> Value + Send + Sync + 'static,
    {
        self.response_hook = Some(Arc::new(hook));
        self
    }

    /// Gets the metrics for this handler.
    pub fn metrics(&self) -> Arc<IdempotencyMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn local_cache_stats(&self) -> Option<Arc<CacheStats>> {
        self.cache.as_ref().map(LocalCache::stats)
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    pub fn scope(&self) -> &str {
        self.key_generator.scope()
    }

    /// Derives the key for `payload`; always bypasses when disabled.
    pub fn derive_key(&self, payload: &Value) -> Result<DerivedKey> {
        if self.config.disabled {
            return Ok(DerivedKey::Bypass);
        }
        self.key_generator.derive(payload)
    }

    pub fn derive_key_from<P: Serialize>(&self, payload: &P) -> Result<DerivedKey> {
        if self.config.disabled {
            return Ok(DerivedKey::Bypass);
        }
        self.key_generator.derive_from(payload)
    }

    /// Drops every locally cached record.
    pub fn clear_local_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.clear();
        }
    }

    /// Runs `producer` at most once for the key derived from `payload`.
    ///
    /// Producer errors come back unchanged. Failures of the idempotency
    /// layer are converted through `E::from`.
    pub async fn process<T, E, F, Fut>(
        &self,
        payload: &Value,
        context: &InvocationContext,
        producer: F,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<IdempotencyError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let derived = self.derive_key(payload).map_err(E::from)?;
        self.process_derived(derived, context, producer).await
    }

    /// Same as [`process`](Self::process) for an already derived key.
    pub async fn process_derived<T, E, F, Fut>(
        &self,
        derived: DerivedKey,
        context: &InvocationContext,
        producer: F,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<IdempotencyError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let (key, payload_hash) = match derived {
            DerivedKey::Bypass => {
                self.record_outcome(Outcome::Bypassed);
                return producer().await;
            }
            DerivedKey::Key {
                idempotency_key,
                payload_hash,
            } => (idempotency_key, payload_hash),
        };

        if let Some(record) = self.cached_replay(&key, payload_hash.as_deref()) {
            tracing::debug!(idempotency_key = %key, "Replaying response from local cache");
            self.record_outcome(Outcome::CacheReplayed);
            return self.replay(record).map_err(E::from);
        }

        match self.claim(&key, payload_hash.clone(), context).await {
            Ok(Claim::Acquired) => {}
            Ok(Claim::Replay(record)) => {
                tracing::debug!(idempotency_key = %key, "Replaying stored response");
                self.cache_record(&record);
                self.record_outcome(Outcome::Replayed);
                return self.replay(record).map_err(E::from);
            }
            Err(err) => {
                self.record_outcome(match &err {
                    IdempotencyError::AlreadyInProgress { .. } => Outcome::InProgress,
                    IdempotencyError::Validation { .. } => Outcome::ValidationFailed,
                    _ => Outcome::PersistenceFailed,
                });
                return Err(E::from(err));
            }
        }

        match producer().await {
            Ok(result) => {
                if let Err(err) = self.save_success(&key, payload_hash, &result).await {
                    self.record_outcome(match &err {
                        IdempotencyError::ResponseSerialization(_) => Outcome::SerializationFailed,
                        _ => Outcome::PersistenceFailed,
                    });
                    return Err(E::from(err));
                }
                self.record_outcome(Outcome::Executed);
                Ok(result)
            }
            Err(err) => {
                tracing::info!(idempotency_key = %key, "Operation failed, releasing idempotency record");
                self.release(&key).await;
                self.record_outcome(Outcome::ProducerFailed);
                Err(err)
            }
        }
    }

    /// Removes records whose expiry has passed from stores without native
    /// item expiry.
    pub async fn purge_expired(&self) -> Result<u64> {
        let removed = self
            .timed("purge_expired", self.store.purge_expired(self.clock.now()))
            .await
            .map_err(|e| IdempotencyError::persistence("Failed to purge expired records", e))?;
        get_metrics().record_purge(removed);
        Ok(removed)
    }

    fn cached_replay(&self, key: &str, payload_hash: Option<&str>) -> Option<IdempotencyRecord> {
        let record = self.cache.as_ref()?.get(key)?;
        let now = self.clock.now();

        if record.is_replayable(now) && record.payload_matches(payload_hash) {
            Some(record)
        } else {
            None
        }
    }

    fn cache_record(&self, record: &IdempotencyRecord) {
        if let Some(cache) = &self.cache {
            cache.set(record.clone());
        }
    }

    /// Claims the generation for `key`, or reports what to do instead.
    async fn claim(
        &self,
        key: &str,
        payload_hash: Option<String>,
        context: &InvocationContext,
    ) -> Result<Claim> {
        let now = self.clock.now();
        let record = IdempotencyRecord::in_progress(
            key,
            payload_hash.clone(),
            now,
            self.config.expires_after_seconds,
            context.remaining_time(),
        );
        let mut condition = WriteCondition::NoLiveRecord { now };

        for attempt in 1..=MAX_CLAIM_ATTEMPTS {
            match self
                .timed("put_in_progress", self.store.put_in_progress(&record, &condition))
                .await
            {
                Ok(()) => {
                    tracing::debug!(idempotency_key = %key, attempt, "Claimed idempotency record");
                    return Ok(Claim::Acquired);
                }
                Err(e) if e.is_conditional_check_failed() => {
                    if attempt == MAX_CLAIM_ATTEMPTS {
                        tracing::info!(idempotency_key = %key, "Lost the race to take over a stale record");
                        break;
                    }
                }
                Err(e) => {
                    return Err(IdempotencyError::persistence(
                        "Failed to save in progress record to idempotency store",
                        e,
                    ))
                }
            }

            let existing = self
                .timed("get", self.store.get(key))
                .await
                .map_err(|e| {
                    IdempotencyError::persistence("Failed to get record from idempotency store", e)
                })?;
            let now = self.clock.now();

            condition = match existing {
                // deleted between our write and read; the key is free again
                None => WriteCondition::NoLiveRecord { now },
                Some(existing) => match existing.effective_status(now) {
                    IdempotencyStatus::Completed => {
                        if !existing.payload_matches(payload_hash.as_deref()) {
                            tracing::warn!(idempotency_key = %key, "Payload does not match stored record");
                            return Err(IdempotencyError::Validation {
                                key: key.to_string(),
                            });
                        }
                        return Ok(Claim::Replay(existing));
                    }
                    IdempotencyStatus::InProgress => {
                        return Err(IdempotencyError::AlreadyInProgress {
                            key: key.to_string(),
                        });
                    }
                    IdempotencyStatus::Expired => {
                        tracing::info!(
                            idempotency_key = %key,
                            stored_status = %existing.status,
                            "Taking over expired idempotency record"
                        );
                        WriteCondition::takeover_of(&existing)
                    }
                },
            };
        }

        Err(IdempotencyError::AlreadyInProgress {
            key: key.to_string(),
        })
    }

    async fn save_success<T: Serialize>(
        &self,
        key: &str,
        payload_hash: Option<String>,
        result: &T,
    ) -> Result<()> {
        let response_data = match serde_json::to_value(result) {
            Ok(value) => value,
            Err(e) => {
                self.release(key).await;
                return Err(IdempotencyError::ResponseSerialization(e));
            }
        };

        let expiry_timestamp = self.clock.now().timestamp() + self.config.expires_after_seconds;

        self.timed(
            "update_complete",
            self.store.update_complete(key, &response_data, expiry_timestamp),
        )
        .await
        .map_err(|e| {
            tracing::error!(
                idempotency_key = %key,
                error = %e,
                "Operation completed but its record could not be updated"
            );
            IdempotencyError::persistence("Failed to update record state to success in idempotency store", e)
        })?;

        self.cache_record(&IdempotencyRecord::completed(
            key,
            payload_hash,
            response_data,
            expiry_timestamp,
        ));

        Ok(())
    }

    /// Best-effort delete so a retry can run the operation again.
    async fn release(&self, key: &str) {
        if let Some(cache) = &self.cache {
            cache.remove(key);
        }

        if let Err(e) = self.timed("delete", self.store.delete(key)).await {
            tracing::error!(
                idempotency_key = %key,
                error = %e,
                "Failed to delete idempotency record after failure"
            );
        }
    }

    fn replay<T: DeserializeOwned>(&self, record: IdempotencyRecord) -> Result<T> {
        let mut response = record.response_data.clone().unwrap_or(Value::Null);
        if let Some(hook) = &self.response_hook {
            response = hook(response, &record);
        }

        serde_json::from_value(response).map_err(|source| IdempotencyError::ResponseDeserialization {
            key: record.idempotency_key,
            source,
        })
    }

    async fn timed<R, Fut>(
        &self,
        operation: &'static str,
        future: Fut,
    ) -> std::result::Result<R, PersistenceError>
    where
        Fut: Future<Output = std::result::Result<R, PersistenceError>>,
    {
        let timer = LatencyTimer::new();
        let result = future.await;
        let success = match &result {
            Ok(_) => true,
            Err(e) => e.is_conditional_check_failed(),
        };
        get_metrics().record_store_operation(operation, timer.elapsed_ms(), success);
        result
    }

    fn record_outcome(&self, outcome: Outcome) {
        self.metrics.record(outcome);
        get_metrics().record_outcome(self.scope(), outcome);
    }
}

/// Background cleanup job for expired idempotency records.
pub struct IdempotencyCleanupJob {
    handler: Arc<IdempotencyHandler>,
    interval_seconds: u64,
}

impl IdempotencyCleanupJob {
    pub fn new(handler: Arc<IdempotencyHandler>, interval_seconds: u64) -> Self {
        Self {
            handler,
            interval_seconds,
        }
    }

    /// Runs the cleanup job once.
    pub async fn run_once(&self) -> Result<u64> {
        self.handler.purge_expired().await
    }

    /// Starts the cleanup job in a background task.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(self.interval_seconds));

            loop {
                interval.tick().await;

                match self.handler.purge_expired().await {
                    Ok(count) => {
                        if count > 0 {
                            tracing::info!("Cleaned up {} expired idempotency records", count);
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to cleanup expired idempotency records: {}", e);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::persistence::MockPersistenceStore;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error("operation failed")]
        Operation,
        #[error(transparent)]
        Idempotency(#[from] IdempotencyError),
    }

    fn start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-18T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    async fn never_called() -> std::result::Result<Value, TestError> {
        panic!("producer must not run")
    }

    fn handler(store: MockPersistenceStore) -> IdempotencyHandler {
        IdempotencyHandler::new(Arc::new(store), "test-func.handler", IdempotencyConfig::default())
            .unwrap()
            .with_clock(Arc::new(ManualClock::new(start())))
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = IdempotencyMetrics::new();
        metrics.record(Outcome::Executed);
        metrics.record(Outcome::Replayed);
        metrics.record(Outcome::CacheReplayed);
        metrics.record(Outcome::InProgress);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 4);
        assert_eq!(snapshot.executed_requests, 1);
        assert_eq!(snapshot.replayed_requests, 2);
        assert_eq!(snapshot.in_progress_rejections, 1);
        assert_eq!(snapshot.replay_rate(), 0.5);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = IdempotencyConfig::default().with_expires_after_seconds(-5);
        let result = IdempotencyHandler::new(
            Arc::new(MockPersistenceStore::new()),
            "scope",
            config,
        );
        assert!(matches!(result, Err(IdempotencyError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_update_failure_is_surfaced_after_execution() {
        let mut store = MockPersistenceStore::new();
        store.expect_put_in_progress().times(1).returning(|_, _| Ok(()));
        store.expect_update_complete().times(1).returning(|key, _, _| {
            Err(PersistenceError::RecordNotFound {
                key: key.to_string(),
            })
        });
        store.expect_delete().never();

        let handler = handler(store);
        let calls = AtomicUsize::new(0);

        let result: std::result::Result<Value, TestError> = handler
            .process(&json!({"id": 1}), &InvocationContext::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"ok": true}))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            result,
            Err(TestError::Idempotency(IdempotencyError::PersistenceLayer { .. }))
        ));
        assert_eq!(handler.metrics().snapshot().persistence_failures, 1);
    }

    #[tokio::test]
    async fn test_unserializable_response_releases_record() {
        let mut store = MockPersistenceStore::new();
        store.expect_put_in_progress().times(1).returning(|_, _| Ok(()));
        store.expect_update_complete().never();
        store.expect_delete().times(1).returning(|_| Ok(()));

        let handler = handler(store);

        // JSON object keys must be strings
        let result: std::result::Result<HashMap<(u8, u8), u8>, TestError> = handler
            .process(&json!({"id": 1}), &InvocationContext::new(), || async {
                Ok(HashMap::from([((1, 2), 3)]))
            })
            .await;

        assert!(matches!(
            result,
            Err(TestError::Idempotency(IdempotencyError::ResponseSerialization(_)))
        ));
        let snapshot = handler.metrics().snapshot();
        assert_eq!(snapshot.serialization_failures, 1);
        assert_eq!(snapshot.persistence_failures, 0);
    }

    #[tokio::test]
    async fn test_delete_failure_does_not_mask_producer_error() {
        let mut store = MockPersistenceStore::new();
        store.expect_put_in_progress().times(1).returning(|_, _| Ok(()));
        store
            .expect_delete()
            .times(1)
            .returning(|_| Err(PersistenceError::Connection("connection reset".to_string())));

        let handler = handler(store);

        let result: std::result::Result<Value, TestError> = handler
            .process(&json!({"id": 1}), &InvocationContext::new(), || async {
                Err(TestError::Operation)
            })
            .await;

        assert!(matches!(result, Err(TestError::Operation)));
        assert_eq!(handler.metrics().snapshot().producer_failures, 1);
    }

    #[tokio::test]
    async fn test_put_failure_never_runs_producer() {
        let mut store = MockPersistenceStore::new();
        store
            .expect_put_in_progress()
            .times(1)
            .returning(|_, _| Err(PersistenceError::Connection("timeout".to_string())));
        store.expect_get().never();

        let handler = handler(store);

        let result: std::result::Result<Value, TestError> = handler
            .process(&json!({"id": 1}), &InvocationContext::new(), never_called)
            .await;

        assert!(matches!(
            result,
            Err(TestError::Idempotency(IdempotencyError::PersistenceLayer { .. }))
        ));
    }

    #[tokio::test]
    async fn test_second_conflict_is_reported_as_in_progress() {
        let stale = IdempotencyRecord::in_progress(
            "ignored",
            None,
            start() - chrono::Duration::hours(2),
            60,
            None,
        );

        let mut store = MockPersistenceStore::new();
        store.expect_put_in_progress().times(2).returning(|record, _| {
            Err(PersistenceError::ConditionalCheckFailed {
                key: record.idempotency_key.clone(),
            })
        });
        store
            .expect_get()
            .times(1)
            .returning(move |_| Ok(Some(stale.clone())));

        let handler = handler(store);

        let result: std::result::Result<Value, TestError> = handler
            .process(&json!({"id": 1}), &InvocationContext::new(), never_called)
            .await;

        match result {
            Err(TestError::Idempotency(err)) => assert!(err.is_retryable()),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_takeover_is_conditioned_on_stale_expiries() {
        let stale = IdempotencyRecord::in_progress(
            "ignored",
            None,
            start() - chrono::Duration::hours(2),
            60,
            None,
        );
        let expected = WriteCondition::takeover_of(&stale);

        let mut store = MockPersistenceStore::new();
        let mut seq = mockall::Sequence::new();
        store
            .expect_put_in_progress()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|_, condition| matches!(condition, WriteCondition::NoLiveRecord { .. }))
            .returning(|record, _| {
                Err(PersistenceError::ConditionalCheckFailed {
                    key: record.idempotency_key.clone(),
                })
            });
        store
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_| Ok(Some(stale.clone())));
        store
            .expect_put_in_progress()
            .times(1)
            .in_sequence(&mut seq)
            .withf(move |_, condition| *condition == expected)
            .returning(|_, _| Ok(()));
        store
            .expect_update_complete()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));

        let handler = handler(store);

        let result: std::result::Result<Value, TestError> = handler
            .process(&json!({"id": 1}), &InvocationContext::new(), || async {
                Ok(json!("done"))
            })
            .await;

        assert_eq!(result.unwrap(), json!("done"));
    }

    #[tokio::test]
    async fn test_response_hook_applies_to_replays() {
        let stored = IdempotencyRecord::completed(
            "ignored",
            None,
            json!({"status": 201}),
            start().timestamp() + 60,
        );

        let mut store = MockPersistenceStore::new();
        store.expect_put_in_progress().returning(|record, _| {
            Err(PersistenceError::ConditionalCheckFailed {
                key: record.idempotency_key.clone(),
            })
        });
        store
            .expect_get()
            .returning(move |_| Ok(Some(stored.clone())));

        let handler = handler(store).with_response_hook(|mut response, _| {
            response["replayed"] = json!(true);
            response
        });

        let result: std::result::Result<Value, TestError> = handler
            .process(&json!({"id": 1}), &InvocationContext::new(), never_called)
            .await;

        assert_eq!(result.unwrap(), json!({"status": 201, "replayed": true}));
    }
}
