use crate::error::PersistenceError;
use crate::idempotency::record::{IdempotencyRecord, IdempotencyStatus};
use crate::persistence::{KeyLayout, PersistenceStore, WriteCondition};
use async_trait::async_trait;
use redis::AsyncCommands;
use serde_json::Value;
use std::collections::HashMap;

const STATUS: &str = "status";
const EXPIRY: &str = "expiry_timestamp";
const IN_PROGRESS_EXPIRY: &str = "in_progress_expiry_timestamp";
const RESPONSE_DATA: &str = "response_data";
const PAYLOAD_HASH: &str = "payload_hash";

// ARGV: mode, status, expiry, in-progress expiry, payload hash,
//       now (s), now (ms), expected expiry, expected in-progress expiry
const PUT_IN_PROGRESS: &str = r#"
local current = redis.call('HMGET', KEYS[1], 'status', 'expiry_timestamp', 'in_progress_expiry_timestamp')
local exists = current[2] ~= false
if ARGV[1] == 'fresh' then
  if exists then
    local live = tonumber(current[2]) >= tonumber(ARGV[6])
    local stale_in_progress = current[1] == 'INPROGRESS'
      and current[3] ~= false and current[3] ~= ''
      and tonumber(current[3]) < tonumber(ARGV[7])
    if live and not stale_in_progress then
      return 0
    end
  end
else
  if not exists then
    return 0
  end
  if current[2] ~= ARGV[8] or (current[3] or '') ~= ARGV[9] then
    return 0
  end
end
redis.call('DEL', KEYS[1])
redis.call('HSET', KEYS[1],
  'status', ARGV[2],
  'expiry_timestamp', ARGV[3],
  'in_progress_expiry_timestamp', ARGV[4],
  'payload_hash', ARGV[5])
redis.call('EXPIREAT', KEYS[1], ARGV[3])
return 1
"#;

// ARGV: response data, expiry
const UPDATE_COMPLETE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
redis.call('HSET', KEYS[1], 'status', 'COMPLETED', 'response_data', ARGV[1], 'expiry_timestamp', ARGV[2])
redis.call('EXPIREAT', KEYS[1], ARGV[2])
return 1
"#;

/// Redis-based idempotency storage.
///
/// Each record is a hash with native `EXPIREAT` expiry. Conditional writes
/// run as Lua scripts so the check and the write are atomic.
pub struct RedisPersistenceStore {
    client: redis::Client,
    layout: KeyLayout,
    put_script: redis::Script,
    update_script: redis::Script,
}

impl RedisPersistenceStore {
    pub fn new(client: redis::Client, layout: KeyLayout) -> Self {
        Self {
            client,
            layout,
            put_script: redis::Script::new(PUT_IN_PROGRESS),
            update_script: redis::Script::new(UPDATE_COMPLETE),
        }
    }

    pub fn open(url: &str, layout: KeyLayout) -> Result<Self, PersistenceError> {
        Ok(Self::new(redis::Client::open(url)?, layout))
    }

    fn record_key(&self, idempotency_key: &str) -> String {
        match self.layout.split(idempotency_key) {
            (partition_key, "") => partition_key.to_string(),
            (partition_key, sort_key) => format!("{}:{}", partition_key, sort_key),
        }
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, PersistenceError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| PersistenceError::Connection(e.to_string()))
    }
}

#[async_trait]
impl PersistenceStore for RedisPersistenceStore {
    async fn put_in_progress(
        &self,
        record: &IdempotencyRecord,
        condition: &WriteCondition,
    ) -> Result<(), PersistenceError> {
        let mut conn = self.connection().await?;
        let key = self.record_key(&record.idempotency_key);

        let (mode, now_secs, now_millis, expected_expiry, expected_in_progress) = match condition {
            WriteCondition::NoLiveRecord { now } => (
                "fresh",
                now.timestamp().to_string(),
                now.timestamp_millis().to_string(),
                String::new(),
                String::new(),
            ),
            WriteCondition::Takeover {
                expiry_timestamp,
                in_progress_expiry_timestamp,
            } => (
                "takeover",
                String::new(),
                String::new(),
                expiry_timestamp.to_string(),
                optional(*in_progress_expiry_timestamp),
            ),
        };

        let accepted: i32 = self
            .put_script
            .key(&key)
            .arg(mode)
            .arg(record.status.as_str())
            .arg(record.expiry_timestamp)
            .arg(optional(record.in_progress_expiry_timestamp))
            .arg(record.payload_hash.as_deref().unwrap_or(""))
            .arg(now_secs)
            .arg(now_millis)
            .arg(expected_expiry)
            .arg(expected_in_progress)
            .invoke_async(&mut conn)
            .await?;

        if accepted == 0 {
            return Err(PersistenceError::ConditionalCheckFailed {
                key: record.idempotency_key.clone(),
            });
        }

        Ok(())
    }

    async fn update_complete(
        &self,
        idempotency_key: &str,
        response_data: &Value,
        expiry_timestamp: i64,
    ) -> Result<(), PersistenceError> {
        let mut conn = self.connection().await?;
        let key = self.record_key(idempotency_key);
        let encoded = serde_json::to_string(response_data)?;

        let updated: i32 = self
            .update_script
            .key(&key)
            .arg(encoded)
            .arg(expiry_timestamp)
            .invoke_async(&mut conn)
            .await?;

        if updated == 0 {
            return Err(PersistenceError::RecordNotFound {
                key: idempotency_key.to_string(),
            });
        }

        Ok(())
    }

    async fn get(&self, idempotency_key: &str) -> Result<Option<IdempotencyRecord>, PersistenceError> {
        let mut conn = self.connection().await?;
        let key = self.record_key(idempotency_key);

        let fields: HashMap<String, String> = conn.hgetall(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        parse_record(idempotency_key, &fields).map(Some)
    }

    async fn delete(&self, idempotency_key: &str) -> Result<(), PersistenceError> {
        let mut conn = self.connection().await?;
        let key = self.record_key(idempotency_key);

        conn.del::<_, ()>(&key).await?;
        Ok(())
    }
}

fn optional(value: Option<i64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn parse_record(
    idempotency_key: &str,
    fields: &HashMap<String, String>,
) -> Result<IdempotencyRecord, PersistenceError> {
    let corrupt = |reason: String| PersistenceError::CorruptRecord {
        key: idempotency_key.to_string(),
        reason,
    };
    let non_empty = |name: &str| fields.get(name).filter(|v| !v.is_empty());

    let status = non_empty(STATUS)
        .ok_or_else(|| corrupt(format!("missing {}", STATUS)))?
        .parse::<IdempotencyStatus>()
        .map_err(corrupt)?;

    let expiry_timestamp = non_empty(EXPIRY)
        .ok_or_else(|| corrupt(format!("missing {}", EXPIRY)))?
        .parse::<i64>()
        .map_err(|e| corrupt(format!("{}: {}", EXPIRY, e)))?;

    let in_progress_expiry_timestamp = non_empty(IN_PROGRESS_EXPIRY)
        .map(|v| v.parse::<i64>())
        .transpose()
        .map_err(|e| corrupt(format!("{}: {}", IN_PROGRESS_EXPIRY, e)))?;

    let response_data = non_empty(RESPONSE_DATA)
        .map(|v| serde_json::from_str::<Value>(v))
        .transpose()?;

    Ok(IdempotencyRecord {
        idempotency_key: idempotency_key.to_string(),
        status,
        expiry_timestamp,
        in_progress_expiry_timestamp,
        response_data,
        payload_hash: non_empty(PAYLOAD_HASH).cloned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_record_key_format() {
        let client = redis::Client::open("redis://localhost:6379").unwrap();

        let single = RedisPersistenceStore::new(client.clone(), KeyLayout::Single);
        assert_eq!(single.record_key("fn#abc"), "fn#abc");

        let composite = RedisPersistenceStore::new(
            client,
            KeyLayout::Composite {
                partition_key: "idempotency#orders".to_string(),
            },
        );
        assert_eq!(composite.record_key("fn#abc"), "idempotency#orders:fn#abc");
    }

    #[test]
    fn test_parse_completed_record() {
        let record = parse_record(
            "fn#abc",
            &fields(&[
                (STATUS, "COMPLETED"),
                (EXPIRY, "1768737600"),
                (IN_PROGRESS_EXPIRY, ""),
                (RESPONSE_DATA, r#"{"ok":true}"#),
                (PAYLOAD_HASH, "h1"),
            ]),
        )
        .unwrap();

        assert_eq!(record.status, IdempotencyStatus::Completed);
        assert_eq!(record.expiry_timestamp, 1768737600);
        assert_eq!(record.in_progress_expiry_timestamp, None);
        assert_eq!(record.response_data, Some(serde_json::json!({"ok": true})));
        assert_eq!(record.payload_hash.as_deref(), Some("h1"));
    }

    #[test]
    fn test_parse_rejects_corrupt_fields() {
        let err = parse_record("fn#abc", &fields(&[(STATUS, "INPROGRESS"), (EXPIRY, "soon")]))
            .unwrap_err();
        assert!(matches!(err, PersistenceError::CorruptRecord { .. }));

        let err = parse_record("fn#abc", &fields(&[(EXPIRY, "1")])).unwrap_err();
        assert!(matches!(err, PersistenceError::CorruptRecord { .. }));
    }
}
