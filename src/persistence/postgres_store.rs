use crate::error::PersistenceError;
use crate::idempotency::record::{IdempotencyRecord, IdempotencyStatus};
use crate::persistence::{KeyLayout, PersistenceStore, WriteCondition};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    status: String,
    expiry_timestamp: i64,
    in_progress_expiry_timestamp: Option<i64>,
    response_data: Option<Value>,
    payload_hash: Option<String>,
}

impl RecordRow {
    fn into_record(self, idempotency_key: &str) -> Result<IdempotencyRecord, PersistenceError> {
        let status = self
            .status
            .parse::<IdempotencyStatus>()
            .map_err(|reason| PersistenceError::CorruptRecord {
                key: idempotency_key.to_string(),
                reason,
            })?;

        Ok(IdempotencyRecord {
            idempotency_key: idempotency_key.to_string(),
            status,
            expiry_timestamp: self.expiry_timestamp,
            in_progress_expiry_timestamp: self.in_progress_expiry_timestamp,
            response_data: self.response_data,
            payload_hash: self.payload_hash,
        })
    }
}

/// PostgreSQL-based idempotency storage.
///
/// Conditional writes use `INSERT .. ON CONFLICT DO UPDATE .. WHERE`, so the
/// accept/reject decision happens inside a single statement.
pub struct PostgresPersistenceStore {
    pool: PgPool,
    table_name: String,
    table: String,
    layout: KeyLayout,
}

impl PostgresPersistenceStore {
    pub fn new(pool: PgPool, table_name: &str, layout: KeyLayout) -> Self {
        Self {
            pool,
            table_name: table_name.to_string(),
            table: quote_ident(table_name),
            layout,
        }
    }

    pub async fn connect(
        url: &str,
        pool_size: u32,
        table_name: &str,
        layout: KeyLayout,
    ) -> Result<Self, PersistenceError> {
        let pool = PgPoolOptions::new()
            .max_connections(pool_size)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await?;

        Ok(Self::new(pool, table_name, layout))
    }

    /// Creates the configured table and its expiry index if missing.
    pub async fn ensure_schema(&self) -> Result<(), PersistenceError> {
        for statement in schema_statements(&self.table_name) {
            sqlx::query(&statement).execute(&self.pool).await?;
        }

        tracing::debug!(table = %self.table_name, "Idempotency table ready");
        Ok(())
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl PersistenceStore for PostgresPersistenceStore {
    async fn put_in_progress(
        &self,
        record: &IdempotencyRecord,
        condition: &WriteCondition,
    ) -> Result<(), PersistenceError> {
        let (partition_key, sort_key) = self.layout.split(&record.idempotency_key);

        let result = match condition {
            WriteCondition::NoLiveRecord { now } => {
                let sql = format!(
                    r#"
                    INSERT INTO {table} AS existing (partition_key, sort_key, status, expiry_timestamp, in_progress_expiry_timestamp, response_data, payload_hash)
                    VALUES ($1, $2, $3, $4, $5, NULL, $6)
                    ON CONFLICT (partition_key, sort_key) DO UPDATE SET
                        status = EXCLUDED.status,
                        expiry_timestamp = EXCLUDED.expiry_timestamp,
                        in_progress_expiry_timestamp = EXCLUDED.in_progress_expiry_timestamp,
                        response_data = NULL,
                        payload_hash = EXCLUDED.payload_hash
                    WHERE existing.expiry_timestamp < $7
                       OR (existing.status = 'INPROGRESS'
                           AND existing.in_progress_expiry_timestamp IS NOT NULL
                           AND existing.in_progress_expiry_timestamp < $8)
                    "#,
                    table = self.table
                );

                sqlx::query(&sql)
                    .bind(partition_key)
                    .bind(sort_key)
                    .bind(record.status.as_str())
                    .bind(record.expiry_timestamp)
                    .bind(record.in_progress_expiry_timestamp)
                    .bind(&record.payload_hash)
                    .bind(now.timestamp())
                    .bind(now.timestamp_millis())
                    .execute(&self.pool)
                    .await?
            }
            WriteCondition::Takeover {
                expiry_timestamp,
                in_progress_expiry_timestamp,
            } => {
                let sql = format!(
                    r#"
                    UPDATE {table}
                    SET status = $3, expiry_timestamp = $4, in_progress_expiry_timestamp = $5,
                        response_data = NULL, payload_hash = $6
                    WHERE partition_key = $1 AND sort_key = $2
                      AND expiry_timestamp = $7
                      AND in_progress_expiry_timestamp IS NOT DISTINCT FROM $8
                    "#,
                    table = self.table
                );

                sqlx::query(&sql)
                    .bind(partition_key)
                    .bind(sort_key)
                    .bind(record.status.as_str())
                    .bind(record.expiry_timestamp)
                    .bind(record.in_progress_expiry_timestamp)
                    .bind(&record.payload_hash)
                    .bind(*expiry_timestamp)
                    .bind(*in_progress_expiry_timestamp)
                    .execute(&self.pool)
                    .await?
            }
        };

        if result.rows_affected() == 0 {
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
        let (partition_key, sort_key) = self.layout.split(idempotency_key);
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = 'COMPLETED', response_data = $3, expiry_timestamp = $4
            WHERE partition_key = $1 AND sort_key = $2
            "#,
            table = self.table
        );

        let result = sqlx::query(&sql)
            .bind(partition_key)
            .bind(sort_key)
            .bind(response_data)
            .bind(expiry_timestamp)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::RecordNotFound {
                key: idempotency_key.to_string(),
            });
        }

        Ok(())
    }

    async fn get(&self, idempotency_key: &str) -> Result<Option<IdempotencyRecord>, PersistenceError> {
        let (partition_key, sort_key) = self.layout.split(idempotency_key);
        let sql = format!(
            r#"
            SELECT status, expiry_timestamp, in_progress_expiry_timestamp, response_data, payload_hash
            FROM {table}
            WHERE partition_key = $1 AND sort_key = $2
            "#,
            table = self.table
        );

        let row = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(partition_key)
            .bind(sort_key)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.into_record(idempotency_key)).transpose()
    }

    async fn delete(&self, idempotency_key: &str) -> Result<(), PersistenceError> {
        let (partition_key, sort_key) = self.layout.split(idempotency_key);
        let sql = format!(
            "DELETE FROM {table} WHERE partition_key = $1 AND sort_key = $2",
            table = self.table
        );

        sqlx::query(&sql)
            .bind(partition_key)
            .bind(sort_key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, PersistenceError> {
        let sql = format!(
            "DELETE FROM {table} WHERE expiry_timestamp < $1",
            table = self.table
        );

        let result = sqlx::query(&sql)
            .bind(now.timestamp())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

fn schema_statements(table_name: &str) -> [String; 2] {
    let table = quote_ident(table_name);
    let index = quote_ident(&format!("{}_expiry_idx", table_name));

    [
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                partition_key VARCHAR(512) NOT NULL,
                sort_key VARCHAR(512) NOT NULL DEFAULT '',
                status VARCHAR(16) NOT NULL,
                expiry_timestamp BIGINT NOT NULL,
                in_progress_expiry_timestamp BIGINT,
                response_data JSONB,
                payload_hash VARCHAR(128),
                PRIMARY KEY (partition_key, sort_key)
            )
            "#,
            table = table
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {index} ON {table} (expiry_timestamp)",
            index = index,
            table = table
        ),
    ]
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
