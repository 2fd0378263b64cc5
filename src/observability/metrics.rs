use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Global metrics instance.
pub static METRICS: OnceLock<Metrics> = OnceLock::new();

/// How a single `process` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Bypassed,
    Executed,
    Replayed,
    CacheReplayed,
    InProgress,
    ValidationFailed,
    ProducerFailed,
    SerializationFailed,
    PersistenceFailed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Bypassed => "bypassed",
            Outcome::Executed => "executed",
            Outcome::Replayed => "replayed",
            Outcome::CacheReplayed => "cache_replayed",
            Outcome::InProgress => "in_progress",
            Outcome::ValidationFailed => "validation_failed",
            Outcome::ProducerFailed => "producer_failed",
            Outcome::SerializationFailed => "serialization_failed",
            Outcome::PersistenceFailed => "persistence_failed",
        }
    }
}

/// Metrics collector for the idempotency layer.
#[derive(Debug, Clone)]
pub struct Metrics {
    initialized: bool,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self { initialized: true }
    }

    pub fn record_outcome(&self, scope: &str, outcome: Outcome) {
        counter!("idempotency_requests_total", "scope" => scope.to_string(), "outcome" => outcome.as_str()).increment(1);
    }

    pub fn record_store_operation(&self, operation: &'static str, duration_ms: f64, success: bool) {
        histogram!("idempotency_store_operation_duration_ms", "operation" => operation).record(duration_ms);
        if !success {
            counter!("idempotency_store_errors_total", "operation" => operation).increment(1);
        }
    }

    pub fn record_local_cache_lookup(&self, hit: bool) {
        counter!("idempotency_local_cache_lookups_total", "hit" => hit.to_string()).increment(1);
    }

    pub fn record_purge(&self, removed: u64) {
        counter!("idempotency_records_purged_total").increment(removed);
    }
}

/// Timer for measuring operation latency.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for LatencyTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Initializes the metrics system and returns the Prometheus handle.
pub fn init_metrics() -> Result<PrometheusHandle, metrics_exporter_prometheus::BuildError> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    METRICS.get_or_init(Metrics::new);

    Ok(METRICS_HANDLE.get_or_init(|| handle).clone())
}

/// Describes all metrics for Prometheus.
fn describe_metrics() {
    describe_counter!("idempotency_requests_total", Unit::Count, "Idempotent calls by outcome");
    describe_histogram!("idempotency_store_operation_duration_ms", Unit::Milliseconds, "Persistence store latency in milliseconds");
    describe_counter!("idempotency_store_errors_total", Unit::Count, "Failed persistence store operations");
    describe_counter!("idempotency_local_cache_lookups_total", Unit::Count, "Local cache lookups by hit/miss");
    describe_counter!("idempotency_records_purged_total", Unit::Count, "Expired records removed by the cleanup job");
}

/// Returns the global metrics instance.
pub fn get_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}
