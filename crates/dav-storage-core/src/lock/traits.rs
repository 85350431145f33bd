use std::time::Duration;

use async_trait::async_trait;

use crate::error::StorageError;

/// Result of a lock acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockAcquireResult {
    /// Whether the lock was acquired.
    pub acquired: bool,
    /// Owner recorded after the attempt: the caller on success, the
    /// competing owner otherwise (`None` if it vanished meanwhile).
    pub current_holder: Option<String>,
}

impl LockAcquireResult {
    /// Create a successful acquisition result.
    pub fn acquired(holder: impl Into<String>) -> Self {
        Self {
            acquired: true,
            current_holder: Some(holder.into()),
        }
    }

    /// Create a failed acquisition result (lock held by another).
    pub fn not_acquired(current_holder: Option<String>) -> Self {
        Self {
            acquired: false,
            current_holder,
        }
    }
}

/// Shared key/value table with TTL expiry, used as a distributed mutex.
///
/// Implementations must be shared by every process and host that serves the
/// same backing store; an in-process map only serializes one process.
/// An expired entry behaves exactly like a missing one.
#[async_trait]
pub trait LockTable: Send + Sync {
    /// Returns the table identifier (e.g., "memory", "file", "kv").
    fn table_type(&self) -> &'static str;

    /// Current value of `key`, if present and not expired.
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Store `value` under `key` unconditionally.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError>;

    /// Store `value` under `key` only if the key is free.
    async fn add(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<LockAcquireResult, StorageError>;

    /// Remove `key`. Returns whether an entry was removed.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    async fn is_locked(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key).await?.is_some())
    }

    /// Remove `key` only if it currently holds `value`.
    ///
    /// Returns the value stored before the call. The default implementation
    /// is check-then-delete; tables that can do better override it.
    async fn delete_if(&self, key: &str, value: &str) -> Result<Option<String>, StorageError> {
        let current = self.get(key).await?;
        if current.as_deref() == Some(value) {
            self.delete(key).await?;
        }
        Ok(current)
    }
}
