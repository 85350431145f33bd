use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dav_storage_core::{LockAcquireResult, LockTable, StorageError};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::kv::KvClient;

/// Smallest `expiration_ttl` KV accepts.
const KV_MIN_TTL_SECS: u64 = 60;

/// Lock record stored in KV.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockData {
    value: String,
    acquired_at: i64,
    /// Expiry as Unix milliseconds. Authoritative over the KV expiry, which
    /// cannot go below a minute.
    expires_at: i64,
}

impl LockData {
    fn is_live(&self) -> bool {
        self.expires_at > chrono::Utc::now().timestamp_millis()
    }
}

/// Lock table on Cloudflare KV, shared by every host that mounts the volume.
///
/// KV is eventually consistent and has no conditional write, so `add` is
/// check, put, then read back. Two hosts racing on a free key can both pass
/// the check; the read-back makes the later writer win and the earlier one
/// see that it lost in most cases, but not all.
///
/// Lock keys: `lock:{key}`
pub struct KvLockTable {
    kv: Arc<KvClient>,
}

impl KvLockTable {
    pub fn new(kv: Arc<KvClient>) -> Self {
        Self { kv }
    }

    fn lock_key(key: &str) -> String {
        format!("lock:{}", key)
    }

    fn kv_ttl(ttl: Duration) -> u64 {
        let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
        secs.max(KV_MIN_TTL_SECS)
    }

    /// Live record under `key`; expired or unreadable records count as free.
    async fn record(&self, key: &str) -> Result<Option<LockData>, StorageError> {
        let Some(raw) = self.kv.get(&Self::lock_key(key)).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<LockData>(&raw) {
            Ok(data) if data.is_live() => Ok(Some(data)),
            Ok(data) => {
                debug!("Lock on {} expired (was held by {})", key, data.value);
                Ok(None)
            }
            Err(e) => {
                debug!("Ignoring unreadable lock record for {}: {}", key, e);
                Ok(None)
            }
        }
    }

    async fn write(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        let now = chrono::Utc::now().timestamp_millis();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let data = LockData {
            value: value.to_string(),
            acquired_at: now,
            expires_at: now.saturating_add(ttl_ms),
        };
        let json = serde_json::to_string(&data).map_err(|e| {
            StorageError::Serialization(format!("Failed to serialize lock data: {}", e))
        })?;

        self.kv
            .put(&Self::lock_key(key), &json, Some(Self::kv_ttl(ttl)))
            .await
    }
}

#[async_trait]
impl LockTable for KvLockTable {
    fn table_type(&self) -> &'static str {
        "kv"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.record(key).await?.map(|data| data.value))
    }

    #[instrument(skip(self), level = "debug")]
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        self.write(key, value, ttl).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn add(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<LockAcquireResult, StorageError> {
        if let Some(existing) = self.record(key).await? {
            debug!("Lock on {} held by {} (requested by {})", key, existing.value, value);
            return Ok(LockAcquireResult::not_acquired(Some(existing.value)));
        }

        self.write(key, value, ttl).await?;

        // Read back: a concurrent writer may have overwritten us
        match self.record(key).await? {
            Some(data) if data.value == value => {
                debug!("Acquired lock on {} for {}", key, value);
                Ok(LockAcquireResult::acquired(value))
            }
            Some(data) => {
                debug!("Lost lock race on {} to {}", key, data.value);
                Ok(LockAcquireResult::not_acquired(Some(data.value)))
            }
            None => Ok(LockAcquireResult::not_acquired(None)),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let live = self.record(key).await?.is_some();
        let removed = self.kv.delete(&Self::lock_key(key)).await?;
        Ok(live && removed)
    }
}
