use crate::error::{IdempotencyError, Result};
use crate::idempotency::key_generator::HashFunction;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Behaviour of the idempotency layer for one wrapped operation.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// Path expression selecting the part of the payload that forms the key.
    /// `None` hashes the whole payload.
    pub event_key_path: Option<String>,
    /// Path expression selecting the part of the payload checked on replay.
    pub payload_validation_path: Option<String>,
    pub raise_on_no_idempotency_key: bool,
    /// At most ten years.
    #[validate(range(min = 1, max = 315360000))]
    pub expires_after_seconds: i64,
    pub use_local_cache: bool,
    #[validate(range(min = 1))]
    pub local_cache_max_items: usize,
    pub hash_function: HashFunction,
    /// Replaces the `<function>.<operation>` scope in generated keys.
    pub key_prefix: Option<String>,
    /// Skips every persistence interaction and runs the operation directly.
    pub disabled: bool,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            event_key_path: None,
            payload_validation_path: None,
            raise_on_no_idempotency_key: false,
            expires_after_seconds: 3600, // 1 hour
            use_local_cache: false,
            local_cache_max_items: 256,
            hash_function: HashFunction::default(),
            key_prefix: None,
            disabled: false,
        }
    }
}

impl IdempotencyConfig {
    pub fn with_event_key_path(mut self, path: impl Into<String>) -> Self {
        self.event_key_path = Some(path.into());
        self
    }

    pub fn with_payload_validation_path(mut self, path: impl Into<String>) -> Self {
        self.payload_validation_path = Some(path.into());
        self
    }

    pub fn with_expires_after_seconds(mut self, seconds: i64) -> Self {
        self.expires_after_seconds = seconds;
        self
    }

    pub fn with_local_cache(mut self, max_items: usize) -> Self {
        self.use_local_cache = true;
        self.local_cache_max_items = max_items;
        self
    }

    pub fn raising_on_missing_key(mut self) -> Self {
        self.raise_on_no_idempotency_key = true;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| IdempotencyError::InvalidConfig(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceBackend {
    Memory,
    Postgres,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceSettings {
    pub backend: PersistenceBackend,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_table_name")]
    pub table_name: String,
    #[serde(default)]
    pub sort_key_enabled: bool,
    #[serde(default)]
    pub static_partition_key: Option<String>,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

fn default_table_name() -> String {
    "idempotency_records".to_string()
}

fn default_pool_size() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_format() -> String {
    "pretty".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_function_name")]
    pub function_name: String,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    pub persistence: PersistenceSettings,
    pub logging: LoggingSettings,
}

fn default_function_name() -> String {
    "test-func".to_string()
}

impl Settings {
    pub fn new() -> std::result::Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("IDEMPOTENCY").separator("__"));

        builder.build()?.try_deserialize()
    }

    /// Partition key used when records share a table with a sort key.
    pub fn static_partition_key(&self) -> String {
        self.persistence
            .static_partition_key
            .clone()
            .unwrap_or_else(|| format!("idempotency#{}", self.function_name))
    }
}
