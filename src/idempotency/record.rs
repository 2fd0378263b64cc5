use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Status of an idempotency record.
///
/// `Expired` is never written to a store. It is what a stored record looks
/// like once its expiry has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IdempotencyStatus {
    InProgress,
    Completed,
    Expired,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::InProgress => "INPROGRESS",
            IdempotencyStatus::Completed => "COMPLETED",
            IdempotencyStatus::Expired => "EXPIRED",
        }
    }
}

impl fmt::Display for IdempotencyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdempotencyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INPROGRESS" => Ok(IdempotencyStatus::InProgress),
            "COMPLETED" => Ok(IdempotencyStatus::Completed),
            "EXPIRED" => Ok(IdempotencyStatus::Expired),
            other => Err(format!("unknown idempotency status '{}'", other)),
        }
    }
}

/// Stored idempotency record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub idempotency_key: String,
    pub status: IdempotencyStatus,
    /// Epoch seconds after which the record no longer counts.
    pub expiry_timestamp: i64,
    /// Epoch milliseconds after which an in-progress record is abandoned.
    pub in_progress_expiry_timestamp: Option<i64>,
    pub response_data: Option<serde_json::Value>,
    pub payload_hash: Option<String>,
}

impl IdempotencyRecord {
    /// Builds the in-progress record that claims a new generation.
    ///
    /// The in-progress lock lasts until the record expires. When the caller's
    /// remaining execution time ends earlier, the record also carries that
    /// earlier point as `in_progress_expiry_timestamp`; otherwise it is left
    /// unset so it always stays strictly before `expiry_timestamp`.
    pub fn in_progress(
        idempotency_key: impl Into<String>,
        payload_hash: Option<String>,
        now: DateTime<Utc>,
        expires_after_seconds: i64,
        remaining_time: Option<std::time::Duration>,
    ) -> Self {
        let expiry_timestamp = (now + Duration::seconds(expires_after_seconds)).timestamp();
        let in_progress_expiry_timestamp = remaining_time
            .and_then(|r| Duration::from_std(r).ok())
            .and_then(|remaining| now.checked_add_signed(remaining))
            .map(|deadline| deadline.timestamp_millis())
            .filter(|millis| *millis < expiry_timestamp * 1000);

        Self {
            idempotency_key: idempotency_key.into(),
            status: IdempotencyStatus::InProgress,
            expiry_timestamp,
            in_progress_expiry_timestamp,
            response_data: None,
            payload_hash,
        }
    }

    /// Builds the completed record a successful execution leaves behind.
    pub fn completed(
        idempotency_key: impl Into<String>,
        payload_hash: Option<String>,
        response_data: serde_json::Value,
        expiry_timestamp: i64,
    ) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            status: IdempotencyStatus::Completed,
            expiry_timestamp,
            in_progress_expiry_timestamp: None,
            response_data: Some(response_data),
            payload_hash,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry_timestamp < now.timestamp()
    }

    pub fn is_in_progress_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == IdempotencyStatus::InProgress
            && self
                .in_progress_expiry_timestamp
                .map(|ts| ts < now.timestamp_millis())
                .unwrap_or(false)
    }

    /// Status as observed at `now`, folding both expiries into `Expired`.
    pub fn effective_status(&self, now: DateTime<Utc>) -> IdempotencyStatus {
        if self.is_expired(now) || self.is_in_progress_expired(now) {
            IdempotencyStatus::Expired
        } else {
            self.status
        }
    }

    /// True when a new generation may overwrite this record at `now`.
    pub fn is_reclaimable(&self, now: DateTime<Utc>) -> bool {
        self.effective_status(now) == IdempotencyStatus::Expired
    }

    /// Replay is only allowed for a live completed record.
    pub fn is_replayable(&self, now: DateTime<Utc>) -> bool {
        self.effective_status(now) == IdempotencyStatus::Completed
    }

    pub fn payload_matches(&self, payload_hash: Option<&str>) -> bool {
        match payload_hash {
            None => true,
            Some(expected) => self.payload_hash.as_deref() == Some(expected),
        }
    }
}
