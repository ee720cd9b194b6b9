use crate::error::AppError;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use tracing::debug;

/// On-disk shape of a durable entry: `{ data, timestamp, expiryTime }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEnvelope<V> {
    pub data: V,
    pub timestamp: i64,
    pub expiry_time: i64,
}

#[derive(Debug, Clone)]
pub struct DurableHit<V> {
    pub value: V,
    pub expiry_time_ms: i64,
}

impl<V> DurableHit<V> {
    pub fn remaining(&self, now_ms: i64) -> Option<Duration> {
        let remaining_ms = self.expiry_time_ms.saturating_sub(now_ms);
        if remaining_ms <= 0 {
            return None;
        }
        Some(Duration::from_millis(remaining_ms as u64))
    }
}

/// Survives restarts; keys are stored as `<namespace>:<key>`.
#[derive(Debug, Clone)]
pub struct SqliteDurableCache {
    pool: SqlitePool,
    namespace: String,
}

impl SqliteDurableCache {
    pub fn new(pool: SqlitePool, namespace: impl Into<String>) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
        }
    }

    fn prefix(&self) -> String {
        format!("{}:", self.namespace)
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{key}", self.namespace)
    }

    pub async fn store<V: Serialize>(
        &self,
        key: &str,
        value: &V,
        ttl: Duration,
        now_ms: i64,
    ) -> Result<(), AppError> {
        let ttl_ms = ttl.as_millis().min(i64::MAX as u128) as i64;
        let expiry_time = now_ms.saturating_add(ttl_ms);
        let envelope = CacheEnvelope {
            data: value,
            timestamp: now_ms,
            expiry_time,
        };
        let encoded = simd_json::serde::to_string(&envelope)?;

        sqlx::query(
            "INSERT INTO cache_entries (key, envelope, expiry_time_ms, updated_at_ms) VALUES (?, ?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET envelope=excluded.envelope, expiry_time_ms=excluded.expiry_time_ms, updated_at_ms=excluded.updated_at_ms",
        )
        .bind(self.namespaced(key))
        .bind(encoded)
        .bind(expiry_time)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Expired or undecodable entries are deleted and reported as absent.
    pub async fn load<V: DeserializeOwned>(
        &self,
        key: &str,
        now_ms: i64,
    ) -> Result<Option<DurableHit<V>>, AppError> {
        let row = sqlx::query("SELECT envelope FROM cache_entries WHERE key = ?")
            .bind(self.namespaced(key))
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let raw: String = row.try_get("envelope")?;

        let mut owned_payload = raw.into_bytes();
        let envelope = match simd_json::serde::from_slice::<CacheEnvelope<V>>(
            owned_payload.as_mut_slice(),
        ) {
            Ok(envelope) => envelope,
            Err(error) => {
                debug!(key, %error, "dropping malformed durable cache entry");
                self.remove(key).await?;
                return Ok(None);
            }
        };

        if envelope.expiry_time <= now_ms {
            self.remove(key).await?;
            return Ok(None);
        }

        Ok(Some(DurableHit {
            value: envelope.data,
            expiry_time_ms: envelope.expiry_time,
        }))
    }

    pub async fn remove(&self, key: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE key = ?")
            .bind(self.namespaced(key))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn purge_expired(&self, now_ms: i64) -> Result<u64, AppError> {
        let prefix = self.prefix();
        let result = sqlx::query(
            "DELETE FROM cache_entries WHERE expiry_time_ms <= ? AND substr(key, 1, ?) = ?",
        )
        .bind(now_ms)
        .bind(prefix.chars().count() as i64)
        .bind(prefix)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Removes every entry in this namespace, leaving other namespaces alone.
    pub async fn clear(&self) -> Result<u64, AppError> {
        let prefix = self.prefix();
        let result = sqlx::query("DELETE FROM cache_entries WHERE substr(key, 1, ?) = ?")
            .bind(prefix.chars().count() as i64)
            .bind(prefix)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
