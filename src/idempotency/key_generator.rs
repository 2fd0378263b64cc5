use crate::config::IdempotencyConfig;
use crate::error::{IdempotencyError, Result};
use crate::idempotency::path::PathExpression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256, Sha384, Sha512};

/// Digest used for idempotency keys and payload validation hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashFunction {
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl HashFunction {
    pub fn hex_digest(&self, data: &[u8]) -> String {
        match self {
            HashFunction::Sha256 => hex::encode(Sha256::digest(data)),
            HashFunction::Sha384 => hex::encode(Sha384::digest(data)),
            HashFunction::Sha512 => hex::encode(Sha512::digest(data)),
        }
    }
}

/// Outcome of key derivation for one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DerivedKey {
    /// No key could be extracted; run the operation without persistence.
    Bypass,
    Key {
        idempotency_key: String,
        payload_hash: Option<String>,
    },
}

impl DerivedKey {
    pub fn idempotency_key(&self) -> Option<&str> {
        match self {
            DerivedKey::Key {
                idempotency_key, ..
            } => Some(idempotency_key),
            DerivedKey::Bypass => None,
        }
    }

    pub fn payload_hash(&self) -> Option<&str> {
        match self {
            DerivedKey::Key { payload_hash, .. } => payload_hash.as_deref(),
            DerivedKey::Bypass => None,
        }
    }
}

/// Derives idempotency keys and payload validation hashes from payloads.
///
/// Keys have the form `<scope>#<hex digest>`, where the digest covers the
/// canonical JSON of the selected payload subset. Object keys are emitted
/// sorted, so logically equal payloads hash identically.
#[derive(Debug, Clone)]
pub struct IdempotencyKeyGenerator {
    scope: String,
    event_key_path: Option<PathExpression>,
    payload_validation_path: Option<PathExpression>,
    hash_function: HashFunction,
    raise_on_missing_key: bool,
}

impl IdempotencyKeyGenerator {
    pub fn new(scope: impl Into<String>, config: &IdempotencyConfig) -> Result<Self> {
        let event_key_path = config
            .event_key_path
            .as_deref()
            .map(PathExpression::parse)
            .transpose()?;
        let payload_validation_path = config
            .payload_validation_path
            .as_deref()
            .map(PathExpression::parse)
            .transpose()?;

        Ok(Self {
            scope: config.key_prefix.clone().unwrap_or_else(|| scope.into()),
            event_key_path,
            payload_validation_path,
            hash_function: config.hash_function,
            raise_on_missing_key: config.raise_on_no_idempotency_key,
        })
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn validates_payload(&self) -> bool {
        self.payload_validation_path.is_some()
    }

    /// Derives the key and optional validation hash for `payload`.
    pub fn derive(&self, payload: &Value) -> Result<DerivedKey> {
        let selected = match &self.event_key_path {
            Some(path) => path.search(payload)?,
            None => payload.clone(),
        };

        if is_missing_key(&selected) {
            if self.raise_on_missing_key {
                return Err(IdempotencyError::MissingIdempotencyKey);
            }
            tracing::warn!(
                scope = %self.scope,
                "No idempotency key value found, skipping persistence layer"
            );
            return Ok(DerivedKey::Bypass);
        }

        let payload_hash = match &self.payload_validation_path {
            Some(path) => Some(self.hash_value(&path.search(payload)?)),
            None => None,
        };

        Ok(DerivedKey::Key {
            idempotency_key: format!("{}#{}", self.scope, self.hash_value(&selected)),
            payload_hash,
        })
    }

    /// Derives a key for any serializable payload.
    pub fn derive_from<P: Serialize>(&self, payload: &P) -> Result<DerivedKey> {
        let value = serde_json::to_value(payload).map_err(IdempotencyError::PayloadSerialization)?;
        self.derive(&value)
    }

    fn hash_value(&self, value: &Value) -> String {
        let canonical = serde_json::to_vec(value).unwrap_or_default();
        self.hash_function.hex_digest(&canonical)
    }
}

/// Null, empty strings, empty objects and lists holding only nulls do not
/// identify a request. Numbers and booleans always do.
fn is_missing_key(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(_) | Value::Number(_) => false,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.iter().all(Value::is_null),
        Value::Object(map) => map.is_empty(),
    }
}
